mod sources;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bench360_core::{GpuVendor, TelemetryConfig, TelemetryReading, TelemetryValues};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::clock::RunClock;

pub use sources::{CompositeSource, HostCpuSource, NvidiaSmiSource, RocmSmiSource};

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("Failed to execute {tool}: {source}")]
    ExecutionFailed {
        tool: &'static str,
        source: std::io::Error,
    },
    #[error("{tool} exited with {status}")]
    ExitStatus {
        tool: &'static str,
        status: std::process::ExitStatus,
    },
    #[error("Could not parse {tool} output: {message}")]
    Parse {
        tool: &'static str,
        message: String,
    },
    #[error("Telemetry poll timed out")]
    TimedOut,
    #[error("No telemetry source produced a value: {0}")]
    Unavailable(String),
}

/// A device that can be polled for utilization and power.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn sample(&self) -> Result<TelemetryValues, TelemetryError>;
}

/// Build the source described by the telemetry config.
pub fn source_from_config(config: &TelemetryConfig) -> Arc<dyn TelemetrySource> {
    let mut sources: Vec<Box<dyn TelemetrySource>> = Vec::new();
    match config.gpu {
        GpuVendor::Nvidia => sources.push(Box::new(NvidiaSmiSource)),
        GpuVendor::Rocm => sources.push(Box::new(RocmSmiSource)),
        GpuVendor::None => {}
    }
    if config.cpu {
        sources.push(Box::new(HostCpuSource::new()));
    }
    Arc::new(CompositeSource::new(sources))
}

/// Periodic poller bound to one scenario execution.
pub struct TelemetrySampler;

impl TelemetrySampler {
    #[instrument(skip(source, clock), fields(source = source.name(), interval_ms = interval.as_millis() as u64))]
    pub fn start(
        source: Arc<dyn TelemetrySource>,
        interval: Duration,
        clock: RunClock,
    ) -> SamplerHandle {
        info!("Starting telemetry sampler");
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let poll_timeout = interval.max(Duration::from_secs(1));

        let task = tokio::spawn(async move {
            let mut readings = Vec::new();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        readings.push(poll(source.as_ref(), clock, poll_timeout).await);
                    }
                }
            }
            // closing reading so the window end is covered
            readings.push(poll(source.as_ref(), clock, poll_timeout).await);
            readings
        });

        SamplerHandle { cancel, task }
    }
}

pub struct SamplerHandle {
    cancel: CancellationToken,
    task: JoinHandle<Vec<TelemetryReading>>,
}

impl SamplerHandle {
    /// Stop polling and hand back every reading in collection order.
    pub async fn stop(self) -> Vec<TelemetryReading> {
        self.cancel.cancel();
        match self.task.await {
            Ok(readings) => {
                let unavailable = readings.iter().filter(|r| r.is_unavailable()).count();
                info!(readings = readings.len(), unavailable, "Telemetry sampler stopped");
                readings
            }
            Err(e) => {
                warn!(error = %e, "Telemetry sampler task failed");
                Vec::new()
            }
        }
    }
}

async fn poll(source: &dyn TelemetrySource, clock: RunClock, timeout: Duration) -> TelemetryReading {
    let timestamp_ms = clock.now_ms();
    let result = match tokio::time::timeout(timeout, source.sample()).await {
        Ok(result) => result,
        Err(_) => Err(TelemetryError::TimedOut),
    };
    match result {
        Ok(values) => TelemetryReading::new(timestamp_ms, values),
        Err(e) => {
            debug!(error = %e, "Telemetry poll failed");
            TelemetryReading::unavailable(timestamp_ms, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Alternates between a fixed reading and a failure.
    struct FlakySource {
        calls: AtomicU32,
    }

    #[async_trait]
    impl TelemetrySource for FlakySource {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn sample(&self) -> Result<TelemetryValues, TelemetryError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 1 {
                return Err(TelemetryError::NotFound("flaky-smi"));
            }
            Ok(TelemetryValues {
                gpu_util_pct: Some(80.0),
                power_watts: Some(150.0),
                ..Default::default()
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_polls_on_interval_and_keeps_failures() {
        let clock = RunClock::start();
        let source = Arc::new(FlakySource {
            calls: AtomicU32::new(0),
        });
        let handle = TelemetrySampler::start(source, Duration::from_millis(500), clock);
        tokio::time::sleep(Duration::from_millis(2200)).await;
        let readings = handle.stop().await;

        // ticks at 0, 500, 1000, 1500, 2000 plus the closing reading
        assert_eq!(readings.len(), 6);
        let stamps: Vec<f64> = readings.iter().map(|r| r.timestamp_ms.round()).collect();
        assert_eq!(stamps, vec![0.0, 500.0, 1000.0, 1500.0, 2000.0, 2200.0]);
        assert_eq!(readings.iter().filter(|r| r.is_unavailable()).count(), 3);
        assert!(readings[1].values.power_watts.is_none());
        assert_eq!(readings[2].values.power_watts, Some(150.0));
    }

    #[test]
    fn test_source_from_config_without_devices() {
        let config = TelemetryConfig {
            interval_ms: 100,
            gpu: GpuVendor::None,
            cpu: false,
        };
        assert_eq!(source_from_config(&config).name(), "composite");
    }
}
