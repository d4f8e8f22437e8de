use serde::{Deserialize, Serialize};

/// Classified cause of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConnectionRefused,
    MalformedResponse,
    Backend5xx,
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConnectionRefused => "connection_refused",
            ErrorKind::MalformedResponse => "malformed_response",
            ErrorKind::Backend5xx => "backend_5xx",
            ErrorKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Timeout,
    Error(ErrorKind),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Timeout => "timeout",
            Outcome::Error(_) => "error",
        }
    }
}

/// Which concurrency lane of a scenario issued a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "index", rename_all = "lowercase")]
pub enum Lane {
    Sequential,
    Batch(u32),
    User(u32),
}

/// Timing and outcome of one request. Timestamps are milliseconds on the run clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub request_id: u64,
    pub prompt_index: usize,
    pub lane: Lane,
    pub submitted_ms: f64,
    pub first_token_ms: Option<f64>,
    pub completed_ms: f64,
    pub prompt_tokens: u32,
    pub generated_tokens: u32,
    pub outcome: Outcome,
    pub text: Option<String>,
}

impl MetricSample {
    /// A request that never resolved in time. Carries no text and no token counts.
    pub fn timed_out(
        request_id: u64,
        prompt_index: usize,
        lane: Lane,
        submitted_ms: f64,
        completed_ms: f64,
    ) -> Self {
        Self {
            request_id,
            prompt_index,
            lane,
            submitted_ms,
            first_token_ms: None,
            completed_ms,
            prompt_tokens: 0,
            generated_tokens: 0,
            outcome: Outcome::Timeout,
            text: None,
        }
    }

    pub fn failed(
        request_id: u64,
        prompt_index: usize,
        lane: Lane,
        submitted_ms: f64,
        completed_ms: f64,
        kind: ErrorKind,
    ) -> Self {
        Self {
            outcome: Outcome::Error(kind),
            ..Self::timed_out(request_id, prompt_index, lane, submitted_ms, completed_ms)
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    pub fn latency_ms(&self) -> f64 {
        (self.completed_ms - self.submitted_ms).max(0.0)
    }

    pub fn ttft_ms(&self) -> Option<f64> {
        self.first_token_ms
            .map(|t| (t - self.submitted_ms).max(0.0))
    }

    /// Mean gap between generated tokens after the first one.
    pub fn inter_token_ms(&self) -> Option<f64> {
        let first = self.first_token_ms?;
        if self.generated_tokens < 2 {
            return None;
        }
        Some((self.completed_ms - first).max(0.0) / (self.generated_tokens - 1) as f64)
    }
}

/// Device values of one telemetry poll. Any field may be unavailable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryValues {
    pub gpu_util_pct: Option<f64>,
    pub gpu_mem_mb: Option<f64>,
    pub cpu_util_pct: Option<f64>,
    pub power_watts: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReading {
    pub timestamp_ms: f64,
    #[serde(flatten)]
    pub values: TelemetryValues,
    /// Set when the poll failed; all values are then null
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TelemetryReading {
    pub fn new(timestamp_ms: f64, values: TelemetryValues) -> Self {
        Self {
            timestamp_ms,
            values,
            error: None,
        }
    }

    pub fn unavailable(timestamp_ms: f64, error: impl Into<String>) -> Self {
        Self {
            timestamp_ms,
            values: TelemetryValues::default(),
            error: Some(error.into()),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        self.error.is_some()
    }
}
