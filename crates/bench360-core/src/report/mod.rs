mod failed;
mod types;

pub use failed::{FailedRun, FailureStage};
pub use types::{
    EnergyBasis, EnergyReport, HistogramSummary, LatencyStats, RequestCounts, RunReport,
    SampleRecord, SampleScores, ServerMetricsSummary, TelemetrySummary, Throughput,
};
