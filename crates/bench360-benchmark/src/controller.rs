use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bench360_core::{
    scorer_for, Bench360Error, FailedRun, FailureStage, HarnessConfig, PromptUnit,
    QualityScorer, RunConfig, RunReport, SampleScores,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::aggregate::{aggregate, sample_details, AggregateInput};
use crate::client::{HttpInferenceClient, InferenceClient};
use crate::clock::RunClock;
use crate::prometheus::{MetricsSnapshot, PrometheusScraper};
use crate::scenario::{DriverEvent, RunContext, ScenarioDriver, ScenarioOutcome};
use crate::store::{ResultStore, StoredRun};
use crate::telemetry::{source_from_config, TelemetrySampler, TelemetrySource};

/// What happened to one configuration of a sweep.
#[derive(Debug)]
pub enum RunOutcome {
    Completed {
        report: Box<RunReport>,
        stored: StoredRun,
    },
    /// Aborted mid-run; the partial report was still stored
    Partial {
        report: Box<RunReport>,
        stored: StoredRun,
        failure: FailedRun,
    },
    Failed(FailedRun),
}

impl RunOutcome {
    pub fn report(&self) -> Option<&RunReport> {
        match self {
            RunOutcome::Completed { report, .. } | RunOutcome::Partial { report, .. } => {
                Some(report)
            }
            RunOutcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&FailedRun> {
        match self {
            RunOutcome::Completed { .. } => None,
            RunOutcome::Partial { failure, .. } | RunOutcome::Failed(failure) => Some(failure),
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            RunOutcome::Completed { .. } => "completed",
            RunOutcome::Partial { .. } => "partial",
            RunOutcome::Failed(_) => "failed",
        }
    }
}

/// Runs configurations one at a time and persists every result, including failures.
pub struct RunController {
    harness: HarnessConfig,
    store: ResultStore,
    cancel: CancellationToken,
    custom_scorer: Option<Arc<dyn QualityScorer>>,
    telemetry: Option<Arc<dyn TelemetrySource>>,
    events: Option<mpsc::Sender<DriverEvent>>,
}

impl RunController {
    pub fn new(harness: HarnessConfig, cancel: CancellationToken) -> Self {
        let store = ResultStore::new(harness.output_dir.clone());
        Self {
            harness,
            store,
            cancel,
            custom_scorer: None,
            telemetry: None,
            events: None,
        }
    }

    /// Scorer used for `Task::Custom` runs.
    pub fn with_custom_scorer(mut self, scorer: Arc<dyn QualityScorer>) -> Self {
        self.custom_scorer = Some(scorer);
        self
    }

    /// Replace the device sources built from the telemetry config.
    pub fn with_telemetry_source(mut self, source: Arc<dyn TelemetrySource>) -> Self {
        self.telemetry = Some(source);
        self
    }

    pub fn with_events(mut self, tx: mpsc::Sender<DriverEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    /// Run every entry in order. A bad entry is recorded and the sweep moves on.
    pub async fn run_sweep(
        &self,
        entries: Vec<serde_json::Value>,
        prompts: Arc<[PromptUnit]>,
    ) -> Vec<RunOutcome> {
        let total = entries.len();
        let mut outcomes = Vec::with_capacity(total);

        for (i, raw) in entries.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(remaining = total - i, "Sweep cancelled, skipping remaining configurations");
                break;
            }
            info!("Configuration {}/{}", i + 1, total);

            let config: RunConfig = match serde_json::from_value(raw.clone()) {
                Ok(c) => c,
                Err(e) => {
                    outcomes.push(self.fail(FailureStage::Config, raw, None, e.to_string()));
                    continue;
                }
            };
            outcomes.push(self.run(&config, Arc::clone(&prompts)).await);
        }
        outcomes
    }

    /// Resolve the backend, connect an HTTP client and run the configuration.
    pub async fn run(&self, config: &RunConfig, prompts: Arc<[PromptUnit]>) -> RunOutcome {
        let endpoint = match self.harness.resolve_backend(&config.backend) {
            Ok(e) => e,
            Err(e) => return self.fail_config(config, e),
        };
        let client = match HttpInferenceClient::new(
            &endpoint.base_url,
            &config.model,
            endpoint.api,
            config.scenario.concurrency() as usize,
        ) {
            Ok(c) => c,
            Err(e) => return self.fail_config(config, e),
        };
        self.run_with_client(config, Arc::new(client), prompts).await
    }

    #[instrument(skip_all, fields(backend = %config.backend, model = %config.model, scenario = config.scenario.label()))]
    pub async fn run_with_client(
        &self,
        config: &RunConfig,
        client: Arc<dyn InferenceClient>,
        prompts: Arc<[PromptUnit]>,
    ) -> RunOutcome {
        if let Err(e) = config.validate() {
            return self.fail_config(config, e);
        }
        let endpoint = match self.harness.resolve_backend(&config.backend) {
            Ok(e) => e,
            Err(e) => return self.fail_config(config, e),
        };
        if prompts.is_empty() {
            return self.fail_config(config, Bench360Error::Config("prompt set is empty".to_string()));
        }
        let hash = config.config_hash();
        let limits = &self.harness.limits;

        for i in 0..config.warmup_requests {
            let prompt = &prompts[i as usize % prompts.len()];
            if let Err(e) = client
                .warmup(prompt, &config.generation, limits.request_timeout())
                .await
            {
                warn!(error = %e, "Warmup request {}/{} failed", i + 1, config.warmup_requests);
            }
        }

        if self.cancel.is_cancelled() {
            warn!("Cancelled before the scenario started");
            return self.fail(
                FailureStage::Scenario,
                config_json(config),
                Some(hash),
                Bench360Error::Cancelled.to_string(),
            );
        }

        let scraper = endpoint.metrics_url.as_deref().and_then(|url| {
            PrometheusScraper::new(url)
                .map_err(|e| warn!(error = %e, "Metrics scraper unavailable"))
                .ok()
        });
        let baseline = match &scraper {
            Some(s) => scrape(s).await,
            None => None,
        };

        let mut driver = match ScenarioDriver::new(
            Arc::clone(&client),
            Arc::clone(&prompts),
            config.generation.clone(),
        ) {
            Ok(d) => d,
            Err(e) => return self.fail_config(config, e),
        };
        if let Some(tx) = &self.events {
            driver = driver.with_events(tx.clone());
        }

        let clock = RunClock::start();
        let source = self
            .telemetry
            .clone()
            .unwrap_or_else(|| source_from_config(&self.harness.telemetry));
        let sampler = TelemetrySampler::start(source, self.harness.telemetry.interval(), clock);
        let ctx = RunContext::new(clock, self.cancel.child_token(), limits, self.harness.seed);

        info!(config_hash = %hash, "Starting scenario");
        let joined = tokio::spawn(driver.run(config.scenario.clone(), ctx)).await;
        let telemetry = sampler.stop().await;

        let outcome = match joined {
            Ok(o) => o,
            Err(e) => {
                error!(error = %e, "Scenario task failed");
                return self.fail(
                    FailureStage::Scenario,
                    config_json(config),
                    Some(hash),
                    e.to_string(),
                );
            }
        };

        let server_metrics = match &scraper {
            Some(s) => scrape(s).await.map(|now| now.since(baseline.as_ref())),
            None => None,
        };

        let quality = self.score(config, &outcome, &prompts);
        let report = aggregate(&AggregateInput {
            config,
            outcome: &outcome,
            telemetry: &telemetry,
            quality: &quality,
            cost: &self.harness.cost,
            server_metrics: server_metrics.as_ref(),
        });
        let details = sample_details(&outcome.samples, &quality);

        let stored = match self.store.write_run(&report, &details) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to persist run");
                return self.fail(FailureStage::Persist, config_json(config), Some(hash), e.to_string());
            }
        };

        if outcome.is_aborted() {
            let reason = outcome
                .abort_reason
                .clone()
                .unwrap_or_else(|| "aborted".to_string());
            let failure = self.fail_record(FailureStage::Aborted, config_json(config), Some(hash), reason);
            return RunOutcome::Partial {
                report: Box::new(report),
                stored,
                failure,
            };
        }

        info!(
            success_rate = report.success_rate,
            tokens_per_sec = report.throughput.tokens_per_sec,
            "Run completed"
        );
        RunOutcome::Completed {
            report: Box::new(report),
            stored,
        }
    }

    /// Quality scores for successful requests only.
    fn score(
        &self,
        config: &RunConfig,
        outcome: &ScenarioOutcome,
        prompts: &[PromptUnit],
    ) -> Vec<SampleScores> {
        let scorer = match (scorer_for(config.task), &self.custom_scorer) {
            (Some(s), _) => s,
            (None, Some(custom)) => Arc::clone(custom),
            (None, None) => {
                warn!(task = config.task.as_str(), "No quality scorer registered, skipping scoring");
                return Vec::new();
            }
        };

        outcome
            .samples
            .iter()
            .filter(|s| s.is_success())
            .filter_map(|s| {
                let text = s.text.as_deref()?;
                let reference = &prompts.get(s.prompt_index)?.reference;
                Some(SampleScores {
                    request_id: s.request_id,
                    scores: scorer.score(text, reference),
                })
            })
            .collect()
    }

    fn fail_config(&self, config: &RunConfig, e: Bench360Error) -> RunOutcome {
        self.fail(
            FailureStage::Config,
            config_json(config),
            Some(config.config_hash()),
            e.to_string(),
        )
    }

    fn fail(
        &self,
        stage: FailureStage,
        config: serde_json::Value,
        hash: Option<String>,
        error: String,
    ) -> RunOutcome {
        RunOutcome::Failed(self.fail_record(stage, config, hash, error))
    }

    fn fail_record(
        &self,
        stage: FailureStage,
        config: serde_json::Value,
        hash: Option<String>,
        error: String,
    ) -> FailedRun {
        let failed = FailedRun::new(stage, config, hash, error, unix_now());
        if let Err(e) = self.store.append_failed(&failed) {
            error!(error = %e, "Could not record failed run");
        }
        failed
    }
}

async fn scrape(scraper: &PrometheusScraper) -> Option<MetricsSnapshot> {
    match scraper.scrape().await {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(error = %e, "Metrics scrape failed");
            None
        }
    }
}

fn config_json(config: &RunConfig) -> serde_json::Value {
    serde_json::to_value(config).unwrap_or(serde_json::Value::Null)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::tests::{prompts, ScriptedClient};
    use crate::telemetry::TelemetryError;
    use async_trait::async_trait;
    use bench360_core::{
        BackendEndpoint, CustomScorer, EnergyBasis, FailureStage, Reference, ScenarioState,
        TelemetryValues,
    };
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct ConstantPower;

    #[async_trait]
    impl TelemetrySource for ConstantPower {
        fn name(&self) -> &'static str {
            "constant"
        }

        async fn sample(&self) -> Result<TelemetryValues, TelemetryError> {
            Ok(TelemetryValues {
                gpu_util_pct: Some(70.0),
                power_watts: Some(200.0),
                ..Default::default()
            })
        }
    }

    fn harness(dir: &TempDir) -> HarnessConfig {
        let mut harness = HarnessConfig {
            output_dir: dir.path().to_path_buf(),
            ..HarnessConfig::default()
        };
        harness.telemetry.interval_ms = 100;
        harness.limits.failure_window = 4;
        harness
    }

    fn controller(dir: &TempDir) -> RunController {
        RunController::new(harness(dir), CancellationToken::new())
            .with_telemetry_source(Arc::new(ConstantPower))
    }

    fn config(json: serde_json::Value) -> RunConfig {
        serde_json::from_value(json).unwrap()
    }

    #[tokio::test]
    async fn test_run_writes_report_and_samples() {
        let dir = TempDir::new().unwrap();
        let controller = controller(&dir);
        let client = Arc::new(ScriptedClient::new(Duration::from_millis(30)));
        let config = config(serde_json::json!({
            "backend": "vllm",
            "model": "m",
            "task": "qa",
            "scenario": {"kind": "batch", "samples": 4, "batch_size": 2},
            "warmup_requests": 1
        }));

        let outcome = controller.run_with_client(&config, client, prompts(3)).await;
        let RunOutcome::Completed { report, stored } = outcome else {
            panic!("expected completed run");
        };

        assert_eq!(report.final_state, ScenarioState::Done);
        assert_eq!(report.requests.total, 4);
        assert_eq!(report.quality_samples, 4);
        assert!(report.quality.contains_key("f1"));
        assert!(report.telemetry.readings >= 2);
        assert_eq!(report.telemetry.power_peak_watts, Some(200.0));
        assert!(report.energy.energy_wh.is_some());
        assert!(report.server_metrics.is_none());
        assert!(stored.report.exists());
        assert!(stored.samples.exists());
        assert!(controller.store().read_failed().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_before_start_records_cancelled_run() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let controller = RunController::new(harness(&dir), cancel.clone())
            .with_telemetry_source(Arc::new(ConstantPower));
        cancel.cancel();
        let client = Arc::new(ScriptedClient::new(Duration::from_millis(5)));
        let config = config(serde_json::json!({
            "backend": "vllm",
            "model": "m",
            "scenario": {"kind": "single", "samples": 3}
        }));

        let outcome = controller.run_with_client(&config, client.clone(), prompts(1)).await;
        let RunOutcome::Failed(failure) = outcome else {
            panic!("expected failed run");
        };
        assert_eq!(failure.stage, FailureStage::Scenario);
        assert_eq!(failure.error, Bench360Error::Cancelled.to_string());
        assert_eq!(client.max_in_flight.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(controller.store().read_failed().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_backend_is_recorded_not_raised() {
        let dir = TempDir::new().unwrap();
        let controller = controller(&dir);
        let config = config(serde_json::json!({
            "backend": "does-not-exist",
            "model": "m",
            "scenario": {"kind": "single", "samples": 1}
        }));

        let outcome = controller.run(&config, prompts(1)).await;
        let failure = outcome.failure().unwrap();
        assert_eq!(failure.stage, FailureStage::Config);
        assert!(failure.error.contains("does-not-exist"));
        assert_eq!(controller.store().read_failed().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_abort_yields_partial_report_and_failure_record() {
        let dir = TempDir::new().unwrap();
        let controller = controller(&dir);
        let client = Arc::new(ScriptedClient::new(Duration::from_millis(5)).failing_from(1));
        let config = config(serde_json::json!({
            "backend": "vllm",
            "model": "m",
            "scenario": {"kind": "single", "samples": 50}
        }));

        let outcome = controller.run_with_client(&config, client, prompts(2)).await;
        let RunOutcome::Partial {
            report,
            stored,
            failure,
        } = outcome
        else {
            panic!("expected partial run");
        };
        assert!(report.is_partial());
        assert_eq!(report.requests.total, 4);
        assert_eq!(report.success_rate, 0.0);
        assert_eq!(report.quality_samples, 0);
        assert_eq!(failure.stage, FailureStage::Aborted);
        assert!(stored.report.exists());

        let logged = controller.store().read_failed().unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].config_hash.as_deref(), Some(config.config_hash().as_str()));
    }

    #[tokio::test]
    async fn test_custom_task_uses_registered_scorer() {
        let dir = TempDir::new().unwrap();
        let scorer = CustomScorer::new(|generated, _reference: &Reference| {
            BTreeMap::from([("chars".to_string(), generated.len() as f64)])
        });
        let controller = controller(&dir).with_custom_scorer(Arc::new(scorer));
        let config = config(serde_json::json!({
            "backend": "vllm",
            "model": "m",
            "task": "custom",
            "scenario": {"kind": "single", "samples": 2}
        }));

        let outcome = controller
            .run_with_client(&config, Arc::new(ScriptedClient::new(Duration::from_millis(5))), prompts(1))
            .await;
        let report = outcome.report().unwrap();
        // ScriptedClient echoes the prompt text "prompt 0"
        assert_eq!(report.quality["chars"], 8.0);
    }

    #[tokio::test]
    async fn test_sweep_continues_past_bad_entries() {
        let dir = TempDir::new().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"text": "0"}],
                "usage": {"prompt_tokens": 5, "completion_tokens": 1}
            })))
            .mount(&server)
            .await;

        let mut harness = harness(&dir);
        harness
            .backends
            .insert("mock".to_string(), BackendEndpoint::new(server.uri()));
        let controller = RunController::new(harness, CancellationToken::new())
            .with_telemetry_source(Arc::new(ConstantPower));

        let entries = vec![
            serde_json::json!({
                "backend": "mock", "model": "m",
                "scenario": {"kind": "single", "samples": 2},
                "generation": {"temperature": 0.0, "top_p": 1.0, "max_tokens": 8, "stream": false}
            }),
            serde_json::json!({"backend": "mock", "model": "m"}),
            serde_json::json!({
                "backend": "mock", "model": "m",
                "scenario": {"kind": "batch", "samples": 4, "batch_size": 0}
            }),
            serde_json::json!({
                "backend": "mock", "model": "m",
                "scenario": {"kind": "batch", "samples": 4, "batch_size": 2},
                "generation": {"temperature": 0.0, "top_p": 1.0, "max_tokens": 8, "stream": false}
            }),
        ];

        let outcomes = controller.run_sweep(entries, prompts(2)).await;
        let statuses: Vec<&str> = outcomes.iter().map(|o| o.status()).collect();
        assert_eq!(statuses, vec!["completed", "failed", "failed", "completed"]);

        let report = outcomes[0].report().unwrap();
        assert_eq!(report.success_rate, 1.0);
        // "0" matches the reference of prompt 0 only
        assert_eq!(report.quality["exact_match"], 0.5);
        assert_eq!(outcomes[3].report().unwrap().requests.success, 4);
        assert_eq!(controller.store().read_failed().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_sweep_stops_early() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let controller = RunController::new(harness(&dir), cancel);
        let outcomes = controller
            .run_sweep(vec![serde_json::json!({"backend": "vllm"})], prompts(1))
            .await;
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_energy_is_estimated_without_power() {
        struct NoDevice;

        #[async_trait]
        impl TelemetrySource for NoDevice {
            fn name(&self) -> &'static str {
                "none"
            }

            async fn sample(&self) -> Result<TelemetryValues, TelemetryError> {
                Err(TelemetryError::NotFound("nvidia-smi"))
            }
        }

        let dir = TempDir::new().unwrap();
        let controller = RunController::new(harness(&dir), CancellationToken::new())
            .with_telemetry_source(Arc::new(NoDevice));
        let config = config(serde_json::json!({
            "backend": "vllm",
            "model": "m",
            "scenario": {"kind": "single", "samples": 2}
        }));
        let outcome = controller
            .run_with_client(&config, Arc::new(ScriptedClient::new(Duration::from_millis(5))), prompts(1))
            .await;
        let report = outcome.report().unwrap();
        assert_eq!(report.energy.basis, EnergyBasis::Estimated);
        assert!(report.energy.energy_wh.is_none());
        assert!(report.telemetry.unavailable_readings >= 1);
    }
}
