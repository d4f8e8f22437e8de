use std::time::Duration;

use rand::rngs::StdRng;
use rand::Rng;

/// Exponential inter-arrival gaps for one virtual user.
#[derive(Debug, Clone)]
pub struct PoissonArrivals {
    rate_per_sec: f64,
    rng: StdRng,
}

impl PoissonArrivals {
    pub fn new(requests_per_min: f64, rng: StdRng) -> Self {
        Self {
            rate_per_sec: requests_per_min / 60.0,
            rng,
        }
    }

    /// Inverse-transform sample of Exp(rate).
    pub fn next_gap(&mut self) -> Duration {
        // gen::<f64>() is in [0, 1); 1 - u is in (0, 1] so ln never sees zero
        let u: f64 = self.rng.gen();
        let secs = -(1.0 - u).ln() / self.rate_per_sec;
        Duration::from_secs_f64(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_same_seed_same_gaps() {
        let mut a = PoissonArrivals::new(30.0, StdRng::seed_from_u64(42));
        let mut b = PoissonArrivals::new(30.0, StdRng::seed_from_u64(42));
        for _ in 0..100 {
            assert_eq!(a.next_gap(), b.next_gap());
        }
    }

    #[test]
    fn test_gaps_follow_exponential_distribution() {
        let n = 20_000;
        let mut arrivals = PoissonArrivals::new(12.0, StdRng::seed_from_u64(7));
        let gaps: Vec<f64> = (0..n).map(|_| arrivals.next_gap().as_secs_f64()).collect();

        let mean = gaps.iter().sum::<f64>() / n as f64;
        assert!((mean - 5.0).abs() / 5.0 < 0.03, "mean gap {}", mean);

        // Exponential: standard deviation equals the mean
        let var = gaps.iter().map(|g| (g - mean).powi(2)).sum::<f64>() / n as f64;
        assert!((var.sqrt() - mean).abs() / mean < 0.05);

        // P(gap > mean) = e^-1
        let above = gaps.iter().filter(|g| **g > 5.0).count() as f64 / n as f64;
        assert!((above - (-1.0f64).exp()).abs() < 0.02);
    }
}
