use std::time::Duration;

use async_trait::async_trait;
use bench360_core::{
    ApiFlavor, Bench360Error, ErrorKind, GenerationParams, Lane, MetricSample, Outcome,
    PromptUnit, Result,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::clock::RunClock;

/// Everything needed to issue and timestamp one request.
#[derive(Debug, Clone)]
pub struct RequestSpec<'a> {
    pub request_id: u64,
    pub prompt_index: usize,
    pub lane: Lane,
    pub prompt: &'a PromptUnit,
    pub params: &'a GenerationParams,
    pub timeout: Duration,
    pub clock: RunClock,
}

/// Issues one inference call. Every failure is encoded in the returned sample.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn send(&self, spec: RequestSpec<'_>) -> MetricSample;

    /// Untimed request used to load weights and warm caches before measuring.
    async fn warmup(
        &self,
        prompt: &PromptUnit,
        params: &GenerationParams,
        timeout: Duration,
    ) -> Result<()> {
        let spec = RequestSpec {
            request_id: 0,
            prompt_index: 0,
            lane: Lane::Sequential,
            prompt,
            params,
            timeout,
            clock: RunClock::start(),
        };
        match self.send(spec).await.outcome {
            Outcome::Success => Ok(()),
            Outcome::Error(kind) => Err(Bench360Error::Http(format!(
                "Warmup failed: {}",
                kind.as_str()
            ))),
            Outcome::Timeout => Err(Bench360Error::Http("Warmup timed out".to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpInferenceClient {
    base_url: String,
    model: String,
    api: ApiFlavor,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    messages: Option<Vec<ChatMessage<'a>>>,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    message: Option<ChoiceContent>,
    #[serde(default)]
    delta: Option<ChoiceContent>,
}

#[derive(Debug, Deserialize)]
struct ChoiceContent {
    #[serde(default)]
    content: Option<String>,
}

impl Choice {
    fn content(&self) -> Option<&str> {
        self.text
            .as_deref()
            .or_else(|| self.message.as_ref().and_then(|m| m.content.as_deref()))
            .or_else(|| self.delta.as_ref().and_then(|d| d.content.as_deref()))
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Debug, Default)]
struct Completion {
    text: String,
    first_token: Option<Instant>,
    usage: Option<Usage>,
    chunks: u32,
}

/// Folds server-sent event lines into a completion.
#[derive(Debug, Default)]
struct StreamAccumulator {
    completion: Completion,
    events: u32,
}

impl StreamAccumulator {
    /// Returns `Ok(true)` once the terminating `[DONE]` event is seen.
    fn feed(&mut self, line: &str) -> std::result::Result<bool, ErrorKind> {
        let line = line.trim();
        let Some(payload) = line.strip_prefix("data:") else {
            return Ok(false);
        };
        let payload = payload.trim();
        if payload == "[DONE]" {
            return Ok(true);
        }

        let chunk: CompletionResponse =
            serde_json::from_str(payload).map_err(|_| ErrorKind::MalformedResponse)?;
        if chunk.error.is_some() {
            return Err(ErrorKind::Other);
        }
        self.events += 1;

        for choice in &chunk.choices {
            let Some(content) = choice.content().filter(|c| !c.is_empty()) else {
                continue;
            };
            if self.completion.first_token.is_none() {
                self.completion.first_token = Some(Instant::now());
            }
            self.completion.text.push_str(content);
            self.completion.chunks += 1;
        }
        if chunk.usage.is_some() {
            self.completion.usage = chunk.usage;
        }
        Ok(false)
    }

    fn finish(self) -> std::result::Result<Completion, ErrorKind> {
        if self.events == 0 {
            return Err(ErrorKind::MalformedResponse);
        }
        Ok(self.completion)
    }
}

impl HttpInferenceClient {
    /// `max_concurrency` sizes the idle connection pool so every lane keeps its own connection.
    pub fn new(
        base_url: &str,
        model: &str,
        api: ApiFlavor,
        max_concurrency: usize,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(max_concurrency.max(1))
            .build()
            .map_err(|e| Bench360Error::Http(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api,
            client,
        })
    }

    /// Model ids served by the backend.
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/v1/models", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Bench360Error::Http(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Bench360Error::Http(format!(
                "Failed to list models: {}",
                resp.status()
            )));
        }

        let models: ModelsResponse = resp
            .json()
            .await
            .map_err(|e| Bench360Error::Http(e.to_string()))?;
        Ok(models.data.into_iter().map(|m| m.id).collect())
    }

    fn build_request<'a>(
        &'a self,
        prompt: &'a PromptUnit,
        params: &GenerationParams,
    ) -> CompletionRequest<'a> {
        let (prompt_field, messages) = match self.api {
            ApiFlavor::Completions => (Some(prompt.prompt.as_str()), None),
            ApiFlavor::ChatCompletions => (
                None,
                Some(vec![ChatMessage {
                    role: "user",
                    content: prompt.prompt.as_str(),
                }]),
            ),
        };

        CompletionRequest {
            model: &self.model,
            prompt: prompt_field,
            messages,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            stream: params.stream,
            stream_options: params.stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }

    async fn execute(&self, spec: &RequestSpec<'_>) -> std::result::Result<Completion, ErrorKind> {
        let url = format!("{}{}", self.base_url, self.api.path());
        let request = self.build_request(spec.prompt, spec.params);

        let resp = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(ErrorKind::Backend5xx);
        }
        if !status.is_success() {
            debug!(status = %status, "backend rejected request");
            return Err(ErrorKind::Other);
        }

        if !spec.params.stream {
            let body = resp.bytes().await.map_err(map_reqwest_error)?;
            let parsed: CompletionResponse =
                serde_json::from_slice(&body).map_err(|_| ErrorKind::MalformedResponse)?;
            if parsed.error.is_some() {
                return Err(ErrorKind::Other);
            }
            let choice = parsed.choices.first().ok_or(ErrorKind::MalformedResponse)?;
            return Ok(Completion {
                text: choice.content().unwrap_or_default().to_string(),
                first_token: None,
                usage: parsed.usage,
                chunks: 0,
            });
        }

        let mut acc = StreamAccumulator::default();
        let mut stream = resp.bytes_stream();
        let mut buf: Vec<u8> = Vec::new();

        'read: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_reqwest_error)?;
            buf.extend_from_slice(&chunk);
            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                if acc.feed(&String::from_utf8_lossy(&line))? {
                    buf.clear();
                    break 'read;
                }
            }
        }
        if !buf.is_empty() {
            acc.feed(&String::from_utf8_lossy(&buf))?;
        }

        acc.finish()
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn send(&self, spec: RequestSpec<'_>) -> MetricSample {
        let submitted_ms = spec.clock.now_ms();
        let result = tokio::time::timeout(spec.timeout, self.execute(&spec)).await;
        let completed_ms = spec.clock.now_ms();

        match result {
            Err(_) => {
                debug!(request_id = spec.request_id, "request timed out");
                MetricSample::timed_out(
                    spec.request_id,
                    spec.prompt_index,
                    spec.lane,
                    submitted_ms,
                    completed_ms,
                )
            }
            Ok(Err(kind)) => {
                debug!(request_id = spec.request_id, kind = kind.as_str(), "request failed");
                MetricSample::failed(
                    spec.request_id,
                    spec.prompt_index,
                    spec.lane,
                    submitted_ms,
                    completed_ms,
                    kind,
                )
            }
            Ok(Ok(completion)) => {
                let (prompt_tokens, generated_tokens) = match completion.usage {
                    Some(u) => (u.prompt_tokens, u.completion_tokens),
                    None => (0, completion.chunks),
                };
                MetricSample {
                    request_id: spec.request_id,
                    prompt_index: spec.prompt_index,
                    lane: spec.lane,
                    submitted_ms,
                    first_token_ms: completion.first_token.map(|t| spec.clock.ms_at(t)),
                    completed_ms,
                    prompt_tokens,
                    generated_tokens,
                    outcome: Outcome::Success,
                    text: Some(completion.text),
                }
            }
        }
    }
}

/// Map reqwest errors to a sample error kind, detecting connection failures
fn map_reqwest_error(e: reqwest::Error) -> ErrorKind {
    if e.is_connect() {
        return ErrorKind::ConnectionRefused;
    }
    if e.is_decode() {
        return ErrorKind::MalformedResponse;
    }
    debug!("HTTP error: {}", e);
    ErrorKind::Other
}
