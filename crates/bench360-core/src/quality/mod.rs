mod scorers;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{Reference, Task};

pub use scorers::{QaScorer, SqlScorer, SummarizationScorer};

/// Task-specific correctness metrics. Implementations must be pure.
pub trait QualityScorer: Send + Sync {
    fn score(&self, generated: &str, reference: &Reference) -> BTreeMap<String, f64>;
}

type ScoreFn = dyn Fn(&str, &Reference) -> BTreeMap<String, f64> + Send + Sync;

/// Adapter for caller-supplied scoring functions.
#[derive(Clone)]
pub struct CustomScorer {
    f: Arc<ScoreFn>,
}

impl CustomScorer {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str, &Reference) -> BTreeMap<String, f64> + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }
}

impl QualityScorer for CustomScorer {
    fn score(&self, generated: &str, reference: &Reference) -> BTreeMap<String, f64> {
        (self.f)(generated, reference)
    }
}

impl std::fmt::Debug for CustomScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CustomScorer")
    }
}

/// Built-in scorer for a task. `Task::Custom` has none; callers register their own.
pub fn scorer_for(task: Task) -> Option<Arc<dyn QualityScorer>> {
    match task {
        Task::Qa => Some(Arc::new(QaScorer)),
        Task::Summarization => Some(Arc::new(SummarizationScorer)),
        Task::Sql => Some(Arc::new(SqlScorer)),
        Task::Custom => None,
    }
}
