use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{MetricSample, RunConfig, ScenarioState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p99_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestCounts {
    pub total: u32,
    pub success: u32,
    pub timeout: u32,
    pub error: u32,
    pub errors_by_kind: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Throughput {
    pub tokens_per_sec: f64,
    pub requests_per_sec: f64,
    pub prompt_tokens: u64,
    pub generated_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySummary {
    pub readings: u32,
    pub unavailable_readings: u32,
    /// Fraction of the run window spanned by usable power readings
    pub coverage: f64,
    pub gpu_util_mean_pct: Option<f64>,
    pub gpu_util_peak_pct: Option<f64>,
    pub gpu_mem_mean_mb: Option<f64>,
    pub gpu_mem_peak_mb: Option<f64>,
    pub cpu_util_mean_pct: Option<f64>,
    pub cpu_util_peak_pct: Option<f64>,
    pub power_mean_watts: Option<f64>,
    pub power_peak_watts: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnergyBasis {
    Measured,
    #[default]
    Estimated,
}

/// Energy for the run window. When `basis` is `Estimated`, `energy_wh` is the point
/// estimate inside `[energy_wh_low, energy_wh_high]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyReport {
    pub basis: EnergyBasis,
    pub energy_wh: Option<f64>,
    pub energy_wh_low: Option<f64>,
    pub energy_wh_high: Option<f64>,
    pub energy_per_request_wh: Option<f64>,
    pub cost: Option<f64>,
    pub cost_per_request: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub avg: f64,
    pub min: Option<f64>,
    pub median: Option<f64>,
    pub max: Option<f64>,
    pub count: f64,
}

/// Backend-reported counters over the run, from its Prometheus endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerMetricsSummary {
    pub prompt_tokens: f64,
    pub generation_tokens: f64,
    pub ttft_secs: Option<HistogramSummary>,
    pub tpot_secs: Option<HistogramSummary>,
    pub e2e_secs: Option<HistogramSummary>,
    pub prefill_secs: Option<HistogramSummary>,
    pub decode_secs: Option<HistogramSummary>,
    pub http_avg_secs: Option<f64>,
    pub decode_tokens_per_sec: Option<f64>,
    pub overall_tokens_per_sec: Option<f64>,
}

/// Aggregated result of one scenario execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub config: RunConfig,
    pub config_hash: String,
    pub final_state: ScenarioState,
    #[serde(default)]
    pub abort_reason: Option<String>,
    pub started_ms: f64,
    pub ended_ms: f64,
    pub duration_secs: f64,
    pub requests: RequestCounts,
    pub success_rate: f64,
    pub ttft: Option<LatencyStats>,
    pub latency: Option<LatencyStats>,
    pub inter_token_ms: Option<f64>,
    pub throughput: Throughput,
    pub telemetry: TelemetrySummary,
    pub energy: EnergyReport,
    pub quality: BTreeMap<String, f64>,
    pub quality_samples: u32,
    #[serde(default)]
    pub server_metrics: Option<ServerMetricsSummary>,
}

impl RunReport {
    pub fn is_partial(&self) -> bool {
        self.final_state == ScenarioState::Aborted
    }
}

/// Per-request line of the detail file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    #[serde(flatten)]
    pub sample: MetricSample,
    pub latency_ms: f64,
    pub ttft_ms: Option<f64>,
    #[serde(default)]
    pub quality: BTreeMap<String, f64>,
}

/// Quality metrics for one scored request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleScores {
    pub request_id: u64,
    pub scores: BTreeMap<String, f64>,
}
