mod run_config;
mod scenario;

pub use run_config::{GenerationParams, RunConfig, Task};
pub use scenario::{Scenario, ScenarioState};
