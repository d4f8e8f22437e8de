use std::collections::VecDeque;

/// Sliding window over the most recent request outcomes.
#[derive(Debug, Clone)]
pub struct FailureWindow {
    capacity: usize,
    max_fraction: f64,
    recent: VecDeque<bool>,
    failures: usize,
}

impl FailureWindow {
    pub fn new(capacity: usize, max_fraction: f64) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            max_fraction,
            recent: VecDeque::with_capacity(capacity),
            failures: 0,
        }
    }

    /// Records one outcome. Returns true once a full window exceeds the failure fraction.
    pub fn record(&mut self, failed: bool) -> bool {
        if self.recent.len() == self.capacity {
            if let Some(true) = self.recent.pop_front() {
                self.failures -= 1;
            }
        }
        self.recent.push_back(failed);
        if failed {
            self.failures += 1;
        }
        self.is_tripped()
    }

    pub fn is_tripped(&self) -> bool {
        self.recent.len() == self.capacity && self.failure_fraction() > self.max_fraction
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }

    pub fn failure_fraction(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        self.failures as f64 / self.recent.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_does_not_trip_before_window_fills() {
        let mut w = FailureWindow::new(4, 0.5);
        assert!(!w.record(true));
        assert!(!w.record(true));
        assert!(!w.record(true));
        assert!(w.record(true));
    }

    #[test]
    fn test_old_failures_slide_out() {
        let mut w = FailureWindow::new(4, 0.5);
        for failed in [true, true, false, false] {
            assert!(!w.record(failed));
        }
        // window: [true, false, false, true] -> 0.5, not above threshold
        assert!(!w.record(true));
        // window: [false, false, true, true] -> 0.5
        assert!(!w.record(true));
        // window: [false, true, true, true] -> 0.75
        assert!(w.record(true));
        assert_eq!(w.failure_fraction(), 0.75);
    }
}
