pub mod aggregate;
pub mod arrival;
pub mod client;
pub mod clock;
pub mod controller;
pub mod failure_window;
pub mod prometheus;
pub mod scenario;
pub mod store;
pub mod telemetry;

pub use aggregate::{aggregate, sample_details, AggregateInput};
pub use arrival::PoissonArrivals;
pub use client::{HttpInferenceClient, InferenceClient, RequestSpec};
pub use clock::RunClock;
pub use controller::{RunController, RunOutcome};
pub use failure_window::FailureWindow;
pub use prometheus::{MetricsSnapshot, PrometheusScraper, ScrapeError};
pub use scenario::{DriverEvent, DriverLimits, RunContext, ScenarioDriver, ScenarioOutcome};
pub use store::{ResultStore, StoreError, StoredRun};
pub use telemetry::{
    source_from_config, CompositeSource, HostCpuSource, NvidiaSmiSource, RocmSmiSource,
    SamplerHandle, TelemetryError, TelemetrySampler, TelemetrySource,
};
