//! Dynamic priority engine
//!
//! Maintains the six priority factors per task and recomputes the dynamic
//! score on submission, on the adjustment interval, and when a soft-edge
//! source completes. Scores are clamped to `[base/2, base*4]`; the tier
//! itself always dominates comparisons, so the clamp only shapes ordering
//! within a tier.
//!
//! The engine also owns the per-category execution history that backs
//! both the `execution_history` factor and the default moving-average
//! predictor.

use crate::config::PriorityWeights;
use crate::graph::DependencyGraph;
use crate::resources::ResourceLedger;
use crate::spec::{Prediction, TaskPredictor};
use crate::types::{DependencyKind, Priority, PriorityFactors, Task, TaskCategory, TaskId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Exponential-moving-average window weight for new observations
const EMA_ALPHA: f64 = 0.2;

/// Score bonus applied when an `Enables` source completes
const ENABLES_BOOST: f64 = 50.0;
/// Score bonus applied when an `Enhances` source completes
const ENHANCES_BOOST: f64 = 20.0;

#[derive(Debug, Clone, Copy, Default)]
struct CategoryStats {
    attempts: u64,
    successes: u64,
    avg_duration_ms: f64,
}

impl CategoryStats {
    fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            // No history yet: neutral signal.
            0.5
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }
}

/// Shared execution history, readable by predictors without holding the
/// priority engine's outer lock
type SharedStats = Arc<RwLock<HashMap<TaskCategory, CategoryStats>>>;

/// Computes and re-adjusts dynamic priority scores
pub struct PriorityEngine {
    weights: PriorityWeights,
    stats: SharedStats,
    /// Score floors of tasks given their one-shot starvation boost;
    /// re-applied on every rescore so the boost cannot oscillate away
    boosted: HashMap<TaskId, f64>,
    /// Accumulated soft-edge boosts per task, applied on every rescore
    soft_boosts: HashMap<TaskId, f64>,
}

impl PriorityEngine {
    pub fn new(weights: PriorityWeights) -> Self {
        Self {
            weights,
            stats: Arc::new(RwLock::new(HashMap::new())),
            boosted: HashMap::new(),
            soft_boosts: HashMap::new(),
        }
    }

    /// Recompute the six factors and the clamped dynamic score of `task`
    pub fn rescore(
        &self,
        task: &mut Task,
        graph: &DependencyGraph,
        ledger: &ResourceLedger,
        now: DateTime<Utc>,
    ) {
        let age_secs = (now - task.created_at).num_milliseconds().max(0) as f64 / 1000.0;
        let factors = PriorityFactors {
            age: age_secs,
            user_importance: task.user_importance,
            system_criticality: task.category.system_criticality(),
            dependency_weight: graph.chain_length(task.id) as f64,
            resource_availability: ledger.availability_score(&task.resource_constraints),
            execution_history: self.success_rate(task.category),
        };

        let w = &self.weights;
        let base = task.base_priority.score();
        let raw = base
            + w.age_weight * factors.age
            + w.user_weight * factors.user_importance
            + w.criticality_weight * factors.system_criticality
            + w.dep_weight * factors.dependency_weight
            + w.resource_weight * factors.resource_availability
            + w.history_weight * factors.execution_history
            + self.soft_boosts.get(&task.id).copied().unwrap_or(0.0);

        task.priority_factors = factors;
        let mut score = raw.clamp(base / 2.0, base * 4.0);
        if let Some(&floor) = self.boosted.get(&task.id) {
            score = score.max(floor);
        }
        task.dynamic_priority = score;
    }

    /// Record a soft-edge boost for `dependent` after one of its
    /// `Enables`/`Enhances` sources completed
    pub fn apply_soft_boost(&mut self, dependent: TaskId, kind: DependencyKind) {
        let bonus = match kind {
            DependencyKind::Enables => ENABLES_BOOST,
            DependencyKind::Enhances => ENHANCES_BOOST,
            _ => return,
        };
        *self.soft_boosts.entry(dependent).or_insert(0.0) += bonus;
        debug!(%dependent, ?kind, bonus, "soft boost");
    }

    /// One-shot starvation relief: raise the task to at least the given
    /// tier, both for tier comparisons and as a score floor. Returns
    /// true the first time only.
    pub fn starvation_boost(&mut self, task: &mut Task, floor: Priority) -> bool {
        if self.boosted.contains_key(&task.id) {
            return false;
        }
        let target = floor.score().max(task.dynamic_priority);
        debug!(task_id = %task.id, from = task.dynamic_priority, to = target, "starvation boost");
        self.boosted.insert(task.id, target);
        task.boosted_tier = Some(floor.max(task.base_priority));
        task.dynamic_priority = target;
        true
    }

    /// Whether the task has already received its starvation boost
    pub fn is_boosted(&self, id: TaskId) -> bool {
        self.boosted.contains_key(&id)
    }

    /// Record a finished attempt into the category history
    pub fn record_outcome(&mut self, category: TaskCategory, success: bool, duration_ms: u64) {
        let mut stats = self.stats.write().expect("stats lock poisoned");
        let entry = stats.entry(category).or_default();
        entry.attempts += 1;
        if success {
            entry.successes += 1;
        }
        entry.avg_duration_ms = if entry.attempts == 1 {
            duration_ms as f64
        } else {
            (1.0 - EMA_ALPHA) * entry.avg_duration_ms + EMA_ALPHA * duration_ms as f64
        };
    }

    /// Drop per-task adjustment state once a task is terminal
    pub fn forget(&mut self, id: TaskId) {
        self.boosted.remove(&id);
        self.soft_boosts.remove(&id);
    }

    fn success_rate(&self, category: TaskCategory) -> f64 {
        self.stats
            .read()
            .expect("stats lock poisoned")
            .get(&category)
            .map(CategoryStats::success_rate)
            .unwrap_or(0.5)
    }

    /// Predictor backed by this engine's category history
    pub fn predictor(&self) -> Arc<dyn TaskPredictor> {
        Arc::new(MovingAveragePredictor {
            stats: Arc::clone(&self.stats),
        })
    }
}

/// Default predictor: per-category moving average of duration and
/// success rate, falling back to the task's own estimate
pub struct MovingAveragePredictor {
    stats: SharedStats,
}

impl TaskPredictor for MovingAveragePredictor {
    fn predict(&self, task: &Task) -> Prediction {
        let stats = self.stats.read().expect("stats lock poisoned");
        match stats.get(&task.category) {
            Some(s) if s.attempts > 0 => Prediction {
                expected_duration_ms: (s.avg_duration_ms.max(1.0)) as u64,
                success_probability: s.success_rate(),
            },
            _ => Prediction {
                expected_duration_ms: task.estimated_duration_ms.max(1),
                success_probability: 0.5,
            },
        }
    }
}
