use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::Scenario;
use crate::{Bench360Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    #[default]
    Qa,
    Summarization,
    Sql,
    Custom,
}

impl Task {
    pub fn as_str(&self) -> &'static str {
        match self {
            Task::Qa => "qa",
            Task::Summarization => "summarization",
            Task::Sql => "sql",
            Task::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_p: 1.0,
            max_tokens: 256,
            stream: true,
        }
    }
}

fn default_stream() -> bool {
    true
}

/// A fully resolved run configuration: one backend, one model, one scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub backend: String,
    pub model: String,
    #[serde(default)]
    pub task: Task,
    pub scenario: Scenario,
    #[serde(default)]
    pub generation: GenerationParams,
    /// Requests issued before measurement starts; never reported
    #[serde(default)]
    pub warmup_requests: u32,
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.backend.trim().is_empty() {
            return Err(Bench360Error::Config("backend is empty".to_string()));
        }
        if self.model.trim().is_empty() {
            return Err(Bench360Error::Config("model is empty".to_string()));
        }

        let g = &self.generation;
        if !(g.temperature.is_finite() && g.temperature >= 0.0) {
            return Err(Bench360Error::Config(format!(
                "temperature must be >= 0, got {}",
                g.temperature
            )));
        }
        if !(g.top_p > 0.0 && g.top_p <= 1.0) {
            return Err(Bench360Error::Config(format!(
                "top_p must be in (0, 1], got {}",
                g.top_p
            )));
        }
        if g.max_tokens == 0 {
            return Err(Bench360Error::Config("max_tokens must be > 0".to_string()));
        }

        self.scenario.validate()
    }

    /// Short SHA-256 over the canonical JSON form of the configuration.
    pub fn config_hash(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let digest = Sha256::digest(canonical.as_bytes());
        hex::encode(digest)[..12].to_string()
    }

    /// Deterministic result file stem.
    pub fn file_stem(&self) -> String {
        let raw = format!(
            "{}_{}_{}_{}_{}_{}",
            self.backend,
            self.model,
            self.task.as_str(),
            self.scenario.label(),
            self.scenario.sweep_tag(),
            self.config_hash()
        );
        sanitize(&raw)
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '-' | '.' => c,
            _ => '-',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RunConfig {
        RunConfig {
            backend: "vllm".to_string(),
            model: "Qwen/Qwen2.5-7B-Instruct".to_string(),
            task: Task::Qa,
            scenario: Scenario::Single { samples: 10 },
            generation: GenerationParams::default(),
            warmup_requests: 0,
        }
    }

    #[test]
    fn test_file_stem_is_deterministic_and_safe() {
        let a = config();
        let b = config();
        assert_eq!(a.file_stem(), b.file_stem());
        assert!(a.file_stem().starts_with("vllm_Qwen-Qwen2.5-7B-Instruct_qa_single_n10_"));
        assert!(!a.file_stem().contains('/'));
    }

    #[test]
    fn test_hash_changes_with_generation_params() {
        let a = config();
        let mut b = config();
        b.generation.temperature = 0.7;
        assert_ne!(a.config_hash(), b.config_hash());
        assert_eq!(a.config_hash().len(), 12);
    }

    #[test]
    fn test_validate_rejects_bad_generation() {
        let mut c = config();
        c.generation.top_p = 0.0;
        assert!(matches!(c.validate(), Err(Bench360Error::Config(_))));

        let mut c = config();
        c.scenario = Scenario::Single { samples: 0 };
        assert!(matches!(c.validate(), Err(Bench360Error::InvalidScenario(_))));
    }

    #[test]
    fn test_unexpanded_sweep_list_does_not_parse() {
        let raw = r#"{
            "backend": "vllm",
            "model": "m",
            "scenario": {"kind": "batch", "samples": 8, "batch_size": [1, 4, 8]}
        }"#;
        assert!(serde_json::from_str::<RunConfig>(raw).is_err());
    }
}
