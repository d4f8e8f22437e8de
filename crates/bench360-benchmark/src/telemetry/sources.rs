use std::sync::Mutex;

use async_trait::async_trait;
use bench360_core::TelemetryValues;
use sysinfo::System;
use tokio::process::Command;
use tracing::debug;

use super::{TelemetryError, TelemetrySource};

const NVIDIA_SMI: &str = "nvidia-smi";
const ROCM_SMI: &str = "rocm-smi";

async fn run_tool(tool: &'static str, args: &[&str]) -> Result<String, TelemetryError> {
    let out = Command::new(tool)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => TelemetryError::NotFound(tool),
            _ => TelemetryError::ExecutionFailed { tool, source: e },
        })?;

    if !out.status.success() {
        return Err(TelemetryError::ExitStatus {
            tool,
            status: out.status,
        });
    }
    Ok(String::from_utf8_lossy(&out.stdout).to_string())
}

/// Polls `nvidia-smi` for every visible GPU.
#[derive(Debug, Default)]
pub struct NvidiaSmiSource;

#[async_trait]
impl TelemetrySource for NvidiaSmiSource {
    fn name(&self) -> &'static str {
        NVIDIA_SMI
    }

    async fn sample(&self) -> Result<TelemetryValues, TelemetryError> {
        let raw = run_tool(
            NVIDIA_SMI,
            &[
                "--query-gpu=utilization.gpu,memory.used,power.draw",
                "--format=csv,noheader,nounits",
            ],
        )
        .await?;
        parse_nvidia_csv(&raw)
    }
}

/// Multi-GPU rows: utilization is averaged, memory and power are summed.
pub(crate) fn parse_nvidia_csv(raw: &str) -> Result<TelemetryValues, TelemetryError> {
    let mut util = Vec::new();
    let mut mem = Vec::new();
    let mut power = Vec::new();
    let mut rows = 0;

    for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 3 {
            return Err(TelemetryError::Parse {
                tool: NVIDIA_SMI,
                message: format!("expected 3 columns, got {:?}", line),
            });
        }
        rows += 1;
        util.extend(parse_number(fields[0]));
        mem.extend(parse_number(fields[1]));
        power.extend(parse_number(fields[2]));
    }

    if rows == 0 {
        return Err(TelemetryError::Parse {
            tool: NVIDIA_SMI,
            message: "no GPU rows".to_string(),
        });
    }

    Ok(TelemetryValues {
        gpu_util_pct: mean(&util),
        gpu_mem_mb: sum(&mem),
        cpu_util_pct: None,
        power_watts: sum(&power),
    })
}

/// Polls `rocm-smi` JSON output for every card.
#[derive(Debug, Default)]
pub struct RocmSmiSource;

#[async_trait]
impl TelemetrySource for RocmSmiSource {
    fn name(&self) -> &'static str {
        ROCM_SMI
    }

    async fn sample(&self) -> Result<TelemetryValues, TelemetryError> {
        let raw = run_tool(
            ROCM_SMI,
            &["--showuse", "--showmeminfo", "vram", "--showpower", "--json"],
        )
        .await?;
        parse_rocm_json(&raw)
    }
}

pub(crate) fn parse_rocm_json(raw: &str) -> Result<TelemetryValues, TelemetryError> {
    let doc: serde_json::Value = serde_json::from_str(raw).map_err(|e| TelemetryError::Parse {
        tool: ROCM_SMI,
        message: e.to_string(),
    })?;
    let cards = doc.as_object().ok_or_else(|| TelemetryError::Parse {
        tool: ROCM_SMI,
        message: "expected a JSON object".to_string(),
    })?;

    let mut util = Vec::new();
    let mut mem = Vec::new();
    let mut power = Vec::new();

    for (card, fields) in cards.iter().filter(|(k, _)| k.starts_with("card")) {
        let Some(fields) = fields.as_object() else {
            continue;
        };
        debug!(card = %card, "Parsing rocm-smi card");
        for (key, value) in fields {
            let Some(v) = value.as_str().and_then(parse_number).or_else(|| value.as_f64()) else {
                continue;
            };
            if key.contains("GPU use") {
                util.push(v);
            } else if key.contains("VRAM Total Used Memory") {
                mem.push(v / (1024.0 * 1024.0));
            } else if key.contains("Power (W)") {
                power.push(v);
            }
        }
    }

    if util.is_empty() && mem.is_empty() && power.is_empty() {
        return Err(TelemetryError::Parse {
            tool: ROCM_SMI,
            message: "no card metrics found".to_string(),
        });
    }

    Ok(TelemetryValues {
        gpu_util_pct: mean(&util),
        gpu_mem_mb: sum(&mem),
        cpu_util_pct: None,
        power_watts: sum(&power),
    })
}

/// Host-wide CPU utilization via sysinfo.
pub struct HostCpuSource {
    system: Mutex<System>,
}

impl HostCpuSource {
    pub fn new() -> Self {
        let mut system = System::new();
        // usage is a delta between refreshes, so prime the first one
        system.refresh_cpu_usage();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for HostCpuSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetrySource for HostCpuSource {
    fn name(&self) -> &'static str {
        "host-cpu"
    }

    async fn sample(&self) -> Result<TelemetryValues, TelemetryError> {
        let mut system = self
            .system
            .lock()
            .map_err(|_| TelemetryError::Unavailable("cpu monitor lock poisoned".to_string()))?;
        system.refresh_cpu_usage();
        let cpus = system.cpus();
        if cpus.is_empty() {
            return Err(TelemetryError::Unavailable("no CPUs reported".to_string()));
        }
        let usage = cpus.iter().map(|c| c.cpu_usage() as f64).sum::<f64>() / cpus.len() as f64;
        Ok(TelemetryValues {
            cpu_util_pct: Some(usage),
            ..Default::default()
        })
    }
}

/// Merges several sources. A reading is produced if at least one source succeeds.
pub struct CompositeSource {
    sources: Vec<Box<dyn TelemetrySource>>,
}

impl CompositeSource {
    pub fn new(sources: Vec<Box<dyn TelemetrySource>>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl TelemetrySource for CompositeSource {
    fn name(&self) -> &'static str {
        "composite"
    }

    async fn sample(&self) -> Result<TelemetryValues, TelemetryError> {
        let mut merged = TelemetryValues::default();
        let mut errors = Vec::new();
        let mut any = false;

        for source in &self.sources {
            match source.sample().await {
                Ok(v) => {
                    any = true;
                    merged.gpu_util_pct = merged.gpu_util_pct.or(v.gpu_util_pct);
                    merged.gpu_mem_mb = merged.gpu_mem_mb.or(v.gpu_mem_mb);
                    merged.cpu_util_pct = merged.cpu_util_pct.or(v.cpu_util_pct);
                    merged.power_watts = merged.power_watts.or(v.power_watts);
                }
                Err(e) => errors.push(format!("{}: {}", source.name(), e)),
            }
        }

        if any {
            return Ok(merged);
        }
        if errors.is_empty() {
            return Err(TelemetryError::Unavailable("no sources configured".to_string()));
        }
        Err(TelemetryError::Unavailable(errors.join("; ")))
    }
}

/// Accepts "45", "45 %", "250.3 W"; rejects "[N/A]" style markers.
fn parse_number(field: &str) -> Option<f64> {
    let token = field.split_whitespace().next()?;
    token.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

fn sum(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum())
}
