use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Bench360Error, Result};

/// Harness-wide settings shared by every run of a sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default = "default_backends")]
    pub backends: BTreeMap<String, BackendEndpoint>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub cost: CostConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub seed: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            backends: default_backends(),
            output_dir: default_output_dir(),
            cost: CostConfig::default(),
            telemetry: TelemetryConfig::default(),
            limits: LimitsConfig::default(),
            seed: 0,
        }
    }
}

impl HarnessConfig {
    pub fn resolve_backend(&self, backend: &str) -> Result<&BackendEndpoint> {
        self.backends
            .get(backend)
            .ok_or_else(|| Bench360Error::UnknownBackend(backend.to_string()))
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_backends() -> BTreeMap<String, BackendEndpoint> {
    [
        ("vllm", "http://localhost:8000"),
        ("sglang", "http://localhost:30000"),
        ("tgi", "http://localhost:8080"),
        ("lmdeploy", "http://localhost:23333"),
    ]
    .into_iter()
    .map(|(name, url)| (name.to_string(), BackendEndpoint::new(url)))
    .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiFlavor {
    #[default]
    Completions,
    ChatCompletions,
}

impl ApiFlavor {
    pub fn path(&self) -> &'static str {
        match self {
            ApiFlavor::Completions => "/v1/completions",
            ApiFlavor::ChatCompletions => "/v1/chat/completions",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendEndpoint {
    pub base_url: String,
    #[serde(default)]
    pub api: ApiFlavor,
    /// Prometheus exposition endpoint, scraped before and after each run
    #[serde(default)]
    pub metrics_url: Option<String>,
}

impl BackendEndpoint {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api: ApiFlavor::default(),
            metrics_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostConfig {
    pub kwh_rate: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self { kwh_rate: 0.12 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    #[default]
    Nvidia,
    Rocm,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub interval_ms: u64,
    #[serde(default)]
    pub gpu: GpuVendor,
    #[serde(default = "default_true")]
    pub cpu: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            gpu: GpuVendor::Nvidia,
            cpu: true,
        }
    }
}

impl TelemetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub request_timeout_secs: u64,
    pub drain_timeout_secs: u64,
    pub abort_grace_secs: u64,
    /// Number of most recent outcomes considered by the failure-rate abort
    pub failure_window: usize,
    pub max_failure_fraction: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 120,
            drain_timeout_secs: 60,
            abort_grace_secs: 5,
            failure_window: 20,
            max_failure_fraction: 0.5,
        }
    }
}

impl LimitsConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn abort_grace(&self) -> Duration {
        Duration::from_secs(self.abort_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_harness_config_fills_defaults() {
        let config: HarnessConfig = serde_json::from_str(r#"{"seed": 7}"#).unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.cost.kwh_rate, 0.12);
        assert_eq!(config.limits.failure_window, 20);
        assert!(config.backends.contains_key("vllm"));
    }

    #[test]
    fn test_unknown_backend_is_an_error() {
        let config = HarnessConfig::default();
        assert!(config.resolve_backend("vllm").is_ok());
        assert!(matches!(
            config.resolve_backend("llamafile"),
            Err(Bench360Error::UnknownBackend(_))
        ));
    }
}
