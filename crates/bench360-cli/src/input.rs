use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use bench360_core::{HarnessConfig, PromptUnit};
use serde::Deserialize;

/// A resolved sweep: harness settings plus one entry per configuration.
#[derive(Debug, Deserialize)]
pub struct SweepFile {
    #[serde(default)]
    pub harness: HarnessConfig,
    /// Kept raw so one malformed entry cannot reject the whole file
    pub runs: Vec<serde_json::Value>,
}

pub fn load_sweep(path: &Path) -> Result<SweepFile> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read sweep file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid sweep file {}", path.display()))
}

/// One `{"prompt": ..., "reference": ...}` object per line.
pub fn load_prompts(path: &Path) -> Result<Vec<PromptUnit>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read prompt file {}", path.display()))?;

    let mut prompts = Vec::new();
    for (n, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let unit: PromptUnit = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid prompt unit", path.display(), n + 1))?;
        prompts.push(unit);
    }

    if prompts.is_empty() {
        bail!("Prompt file {} has no prompts", path.display());
    }
    Ok(prompts)
}

/// Apply `BENCH360_OUTPUT_DIR` and `BENCH360_SEED`, then explicit flags on top.
pub fn apply_overrides(
    harness: &mut HarnessConfig,
    env: impl Fn(&str) -> Option<String>,
    output: Option<&Path>,
    seed: Option<u64>,
) -> Result<()> {
    if let Some(dir) = env("BENCH360_OUTPUT_DIR") {
        harness.output_dir = dir.into();
    }
    if let Some(raw) = env("BENCH360_SEED") {
        harness.seed = raw
            .parse()
            .with_context(|| format!("BENCH360_SEED is not a number: {}", raw))?;
    }
    if let Some(dir) = output {
        harness.output_dir = dir.to_path_buf();
    }
    if let Some(seed) = seed {
        harness.seed = seed;
    }
    Ok(())
}
