use serde::{Deserialize, Serialize};

use crate::{Bench360Error, Result};

/// Load pattern applied to a backend, with its sampling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Scenario {
    Single {
        samples: u32,
    },
    Batch {
        samples: u32,
        batch_size: u32,
    },
    Server {
        run_time_secs: u64,
        concurrent_users: u32,
        requests_per_user_per_min: f64,
    },
}

impl Scenario {
    pub fn label(&self) -> &'static str {
        match self {
            Scenario::Single { .. } => "single",
            Scenario::Batch { .. } => "batch",
            Scenario::Server { .. } => "server",
        }
    }

    /// Sweep parameters rendered for result file names.
    pub fn sweep_tag(&self) -> String {
        match self {
            Scenario::Single { samples } => format!("n{}", samples),
            Scenario::Batch {
                samples,
                batch_size,
            } => format!("n{}_b{}", samples, batch_size),
            Scenario::Server {
                run_time_secs,
                concurrent_users,
                requests_per_user_per_min,
            } => format!(
                "u{}_r{}_t{}",
                concurrent_users,
                requests_per_user_per_min,
                run_time_secs
            ),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            Scenario::Single { samples } if samples == 0 => Err(invalid("samples must be > 0")),
            Scenario::Batch { samples, .. } if samples == 0 => {
                Err(invalid("samples must be > 0"))
            }
            Scenario::Batch { batch_size, .. } if batch_size == 0 => {
                Err(invalid("batch_size must be > 0"))
            }
            Scenario::Server { run_time_secs, .. } if run_time_secs == 0 => {
                Err(invalid("run_time_secs must be > 0"))
            }
            Scenario::Server {
                concurrent_users, ..
            } if concurrent_users == 0 => Err(invalid("concurrent_users must be > 0")),
            Scenario::Server {
                requests_per_user_per_min,
                ..
            } if !(requests_per_user_per_min.is_finite() && requests_per_user_per_min > 0.0) => {
                Err(invalid("requests_per_user_per_min must be a positive number"))
            }
            _ => Ok(()),
        }
    }

    /// Upper bound on simultaneously in-flight requests.
    pub fn concurrency(&self) -> u32 {
        match *self {
            Scenario::Single { .. } => 1,
            Scenario::Batch { batch_size, .. } => batch_size,
            Scenario::Server {
                concurrent_users, ..
            } => concurrent_users,
        }
    }
}

fn invalid(msg: &str) -> Bench360Error {
    Bench360Error::InvalidScenario(msg.to_string())
}

/// Scenario driver lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioState {
    #[default]
    Idle,
    Running,
    Draining,
    Done,
    Aborted,
}

impl ScenarioState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioState::Idle => "idle",
            ScenarioState::Running => "running",
            ScenarioState::Draining => "draining",
            ScenarioState::Done => "done",
            ScenarioState::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ScenarioState::Done | ScenarioState::Aborted)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition(&self, next: ScenarioState) -> bool {
        use ScenarioState::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Running, Draining)
                | (Running, Aborted)
                | (Draining, Done)
                | (Draining, Aborted)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_tagged_serde() {
        let s: Scenario =
            serde_json::from_str(r#"{"kind":"batch","samples":8,"batch_size":4}"#).unwrap();
        assert_eq!(
            s,
            Scenario::Batch {
                samples: 8,
                batch_size: 4
            }
        );
        assert_eq!(s.sweep_tag(), "n8_b4");
    }

    #[test]
    fn test_unknown_scenario_kind_rejected() {
        let parsed = serde_json::from_str::<Scenario>(r#"{"kind":"burst","samples":8}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_validate() {
        assert!(Scenario::Single { samples: 0 }.validate().is_err());
        assert!(Scenario::Batch {
            samples: 4,
            batch_size: 0
        }
        .validate()
        .is_err());
        assert!(Scenario::Server {
            run_time_secs: 10,
            concurrent_users: 2,
            requests_per_user_per_min: f64::NAN
        }
        .validate()
        .is_err());
        assert!(Scenario::Server {
            run_time_secs: 10,
            concurrent_users: 2,
            requests_per_user_per_min: 30.0
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn test_state_transitions() {
        use ScenarioState::*;
        assert!(Idle.can_transition(Running));
        assert!(Running.can_transition(Aborted));
        assert!(Draining.can_transition(Aborted));
        assert!(!Idle.can_transition(Done));
        assert!(!Done.can_transition(Running));
        assert!(!Aborted.can_transition(Done));
    }
}
