// Domain modules
pub mod config;
pub mod error;
pub mod metrics;
pub mod prompt;
pub mod quality;
pub mod report;
pub mod run;

pub use config::{
    ApiFlavor, BackendEndpoint, CostConfig, GpuVendor, HarnessConfig, LimitsConfig,
    TelemetryConfig,
};
pub use error::{Bench360Error, Result};
pub use metrics::{ErrorKind, Lane, MetricSample, Outcome, TelemetryReading, TelemetryValues};
pub use prompt::{PromptUnit, Reference};
pub use quality::{scorer_for, CustomScorer, QualityScorer};
pub use report::{
    EnergyBasis, EnergyReport, FailedRun, FailureStage, HistogramSummary, LatencyStats,
    RequestCounts, RunReport, SampleRecord, SampleScores, ServerMetricsSummary,
    TelemetrySummary, Throughput,
};
pub use run::{GenerationParams, RunConfig, Scenario, ScenarioState, Task};
