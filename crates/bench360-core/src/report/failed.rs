use serde::{Deserialize, Serialize};

/// Where a run stopped making progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    /// Configuration could not be parsed, validated or resolved
    Config,
    /// Scenario aborted; a partial report was still written
    Aborted,
    /// Scenario execution itself failed
    Scenario,
    /// Results could not be persisted
    Persist,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Config => "config",
            FailureStage::Aborted => "aborted",
            FailureStage::Scenario => "scenario",
            FailureStage::Persist => "persist",
        }
    }
}

/// Line of the append-only failed-configurations log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedRun {
    pub id: String,
    pub timestamp: i64,
    pub stage: FailureStage,
    /// Raw configuration as received, which may not have parsed
    pub config: serde_json::Value,
    pub config_hash: Option<String>,
    pub error: String,
}

impl FailedRun {
    pub fn new(
        stage: FailureStage,
        config: serde_json::Value,
        config_hash: Option<String>,
        error: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp,
            stage,
            config,
            config_hash,
            error: error.into(),
        }
    }
}
