
use tokio::time::Instant;

/// Shared time origin for every timestamp recorded during one run.
#[derive(Debug, Clone, Copy)]
pub struct RunClock {
    origin: Instant,
}

impl RunClock {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> f64 {
        self.ms_at(Instant::now())
    }

    pub fn ms_at(&self, at: Instant) -> f64 {
        at.saturating_duration_since(self.origin).as_secs_f64() * 1000.0
    }
}

impl Default for RunClock {
    fn default() -> Self {
        Self::start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_clock_tracks_paused_time() {
        let clock = RunClock::start();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!((clock.now_ms() - 250.0).abs() < 1e-6);
        let later = Instant::now() + Duration::from_millis(1500);
        assert!((clock.ms_at(later) - 1750.0).abs() < 1e-6);
    }
}
