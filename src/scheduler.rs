//! Task selection
//!
//! On each tick the engine hands the scheduler the eligible candidates
//! (dependency-ready, pre-conditions passed, reservations tentatively
//! held) and the number of free worker slots; the scheduler returns the
//! dispatch list under the configured algorithm.
//!
//! Whatever the algorithm, the critical tier is absolute: no candidate
//! from a lower tier is picked ahead of an eligible critical task, and
//! ties everywhere resolve by tier, then dynamic score, then age, then
//! id.

use crate::config::SchedulingAlgorithm;
use crate::spec::TaskPredictor;
use crate::types::{Priority, Task, TaskId};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::trace;

/// Per-tick inputs to selection
#[derive(Debug, Clone)]
pub struct SelectionContext {
    /// Free worker slots this tick
    pub slots: usize,
    /// `running / max_concurrent`, the hybrid load signal
    pub load: f64,
    /// Pool name → total capacity, for footprint packing
    pub capacities: HashMap<String, u64>,
    pub now: DateTime<Utc>,
}

/// Universal tie-break: tier, then dynamic score, then submission age,
/// then id
pub fn tie_break(a: &Task, b: &Task) -> Ordering {
    b.tier()
        .cmp(&a.tier())
        .then_with(|| b.dynamic_priority.total_cmp(&a.dynamic_priority))
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.to_string().cmp(&b.id.to_string()))
}

/// Chooses which eligible tasks to dispatch each tick
pub struct Scheduler {
    algorithm: SchedulingAlgorithm,
    enable_batching: bool,
    /// When off, predictor-driven selection falls back to weighted-fair
    smart_scheduling: bool,
    predictor: Arc<dyn TaskPredictor>,
    /// Tier rotation position carried across round-robin ticks
    tier_cursor: usize,
    /// Weighted-fair token buckets per tier
    buckets: HashMap<Priority, f64>,
    /// Per-tier completion counts backing the fairness index
    completions_by_tier: HashMap<Priority, u64>,
}

impl Scheduler {
    pub fn new(
        algorithm: SchedulingAlgorithm,
        enable_batching: bool,
        smart_scheduling: bool,
        predictor: Arc<dyn TaskPredictor>,
    ) -> Self {
        Self {
            algorithm,
            enable_batching,
            smart_scheduling,
            predictor,
            tier_cursor: 0,
            buckets: HashMap::new(),
            completions_by_tier: HashMap::new(),
        }
    }

    pub fn algorithm(&self) -> SchedulingAlgorithm {
        self.algorithm
    }

    /// Select up to `ctx.slots` tasks from `candidates` for dispatch,
    /// in dispatch order
    pub fn select(&mut self, candidates: &[Task], ctx: &SelectionContext) -> Vec<TaskId> {
        if ctx.slots == 0 || candidates.is_empty() {
            return Vec::new();
        }
        let algorithm = self.resolve(candidates, ctx);
        trace!(?algorithm, candidates = candidates.len(), slots = ctx.slots, "selecting");

        let mut picks = match algorithm {
            SchedulingAlgorithm::RoundRobin => self.select_round_robin(candidates, ctx.slots),
            SchedulingAlgorithm::WeightedFair => self.select_weighted_fair(candidates, ctx.slots),
            SchedulingAlgorithm::DeadlineAware => {
                Self::select_deadline_aware(candidates, ctx.slots, ctx.now)
            }
            SchedulingAlgorithm::ResourceAware => {
                Self::select_resource_aware(candidates, ctx.slots, &ctx.capacities)
            }
            SchedulingAlgorithm::MlOptimized => {
                self.select_ml_optimized(candidates, ctx.slots)
            }
            // resolve() never returns Hybrid
            SchedulingAlgorithm::Hybrid => unreachable!("hybrid resolves to a concrete algorithm"),
        };

        if self.enable_batching {
            self.expand_batches(&mut picks, candidates, ctx.slots);
        }
        picks.truncate(ctx.slots);
        picks
    }

    /// Record a completion for fairness accounting
    pub fn record_completion(&mut self, tier: Priority) {
        *self.completions_by_tier.entry(tier).or_insert(0) += 1;
    }

    /// Jain's fairness index over per-tier throughput; 1.0 is perfectly
    /// fair, 1/n is maximally skewed
    pub fn fairness_index(&self) -> f64 {
        let values: Vec<f64> = self
            .completions_by_tier
            .values()
            .filter(|&&v| v > 0)
            .map(|&v| v as f64)
            .collect();
        if values.is_empty() {
            return 1.0;
        }
        let sum: f64 = values.iter().sum();
        let sum_sq: f64 = values.iter().map(|v| v * v).sum();
        (sum * sum) / (values.len() as f64 * sum_sq)
    }

    fn resolve(&self, candidates: &[Task], ctx: &SelectionContext) -> SchedulingAlgorithm {
        if self.algorithm == SchedulingAlgorithm::MlOptimized && !self.smart_scheduling {
            return SchedulingAlgorithm::WeightedFair;
        }
        if self.algorithm != SchedulingAlgorithm::Hybrid {
            return self.algorithm;
        }
        if ctx.load > 0.8 {
            return SchedulingAlgorithm::ResourceAware;
        }
        let urgent = candidates
            .iter()
            .any(|t| matches!(t.deadline_slack(ctx.now), Some(slack) if slack < 2.0));
        if urgent {
            SchedulingAlgorithm::DeadlineAware
        } else {
            SchedulingAlgorithm::WeightedFair
        }
    }

    /// One pick per tier per pass, rotating the starting tier across
    /// ticks so lower tiers keep a minimum share
    fn select_round_robin(&mut self, candidates: &[Task], slots: usize) -> Vec<TaskId> {
        let mut by_tier: HashMap<Priority, VecDeque<&Task>> = HashMap::new();
        let mut sorted: Vec<&Task> = candidates.iter().collect();
        sorted.sort_by(|a, b| tie_break(a, b));
        for task in sorted {
            by_tier.entry(task.tier()).or_default().push_back(task);
        }

        let mut picks = Vec::new();
        let start = self.tier_cursor;
        loop {
            let mut progressed = false;
            for i in 0..Priority::TIERS.len() {
                let tier = Priority::TIERS[(start + i) % Priority::TIERS.len()];
                if let Some(task) = by_tier.get_mut(&tier).and_then(VecDeque::pop_front) {
                    picks.push(task.id);
                    progressed = true;
                    if picks.len() == slots {
                        self.tier_cursor = (self.tier_cursor + 1) % Priority::TIERS.len();
                        return picks;
                    }
                }
            }
            if !progressed {
                break;
            }
        }
        self.tier_cursor = (self.tier_cursor + 1) % Priority::TIERS.len();
        picks
    }

    /// Token buckets refilled proportionally to tier score; a pick
    /// spends one token. Remaining slots are filled work-conserving.
    fn select_weighted_fair(&mut self, candidates: &[Task], slots: usize) -> Vec<TaskId> {
        let cap = (slots * 2) as f64;
        for tier in Priority::TIERS {
            let refill = tier.score() / Priority::Critical.score();
            let bucket = self.buckets.entry(tier).or_insert(1.0);
            *bucket = (*bucket + refill).min(cap);
        }

        let mut sorted: Vec<&Task> = candidates.iter().collect();
        sorted.sort_by(|a, b| tie_break(a, b));

        let mut picks = Vec::new();
        let mut skipped: Vec<&Task> = Vec::new();
        for task in &sorted {
            if picks.len() == slots {
                break;
            }
            let bucket = self.buckets.entry(task.tier()).or_insert(1.0);
            if *bucket >= 1.0 {
                *bucket -= 1.0;
                picks.push(task.id);
            } else {
                skipped.push(task);
            }
        }
        // Work-conserving: spend empty buckets rather than idle slots.
        for task in skipped {
            if picks.len() == slots {
                break;
            }
            picks.push(task.id);
        }
        picks
    }

    /// Shortest normalized deadline slack first; the critical tier is
    /// still dispatched ahead of everything
    fn select_deadline_aware(candidates: &[Task], slots: usize, now: DateTime<Utc>) -> Vec<TaskId> {
        let mut sorted: Vec<&Task> = candidates.iter().collect();
        sorted.sort_by(|a, b| {
            let a_critical = a.tier() == Priority::Critical;
            let b_critical = b.tier() == Priority::Critical;
            b_critical
                .cmp(&a_critical)
                .then_with(|| {
                    let slack_a = a.deadline_slack(now).unwrap_or(f64::INFINITY);
                    let slack_b = b.deadline_slack(now).unwrap_or(f64::INFINITY);
                    slack_a.total_cmp(&slack_b)
                })
                .then_with(|| tie_break(a, b))
        });
        sorted.into_iter().take(slots).map(|t| t.id).collect()
    }

    /// First-fit-decreasing by dominant resource share: the largest
    /// footprints pack first while capacity remains
    fn select_resource_aware(
        candidates: &[Task],
        slots: usize,
        capacities: &HashMap<String, u64>,
    ) -> Vec<TaskId> {
        let mut sorted: Vec<&Task> = candidates.iter().collect();
        sorted.sort_by(|a, b| {
            let a_critical = a.tier() == Priority::Critical;
            let b_critical = b.tier() == Priority::Critical;
            b_critical
                .cmp(&a_critical)
                .then_with(|| {
                    b.dominant_resource_share(capacities)
                        .total_cmp(&a.dominant_resource_share(capacities))
                })
                .then_with(|| tie_break(a, b))
        });
        sorted.into_iter().take(slots).map(|t| t.id).collect()
    }

    /// Rank by `P(success) / predicted_duration`
    fn select_ml_optimized(&self, candidates: &[Task], slots: usize) -> Vec<TaskId> {
        let mut scored: Vec<(&Task, f64)> = candidates
            .iter()
            .map(|t| {
                let p = self.predictor.predict(t);
                let score = p.success_probability / p.expected_duration_ms.max(1) as f64;
                (t, score)
            })
            .collect();
        scored.sort_by(|(a, sa), (b, sb)| {
            let a_critical = a.tier() == Priority::Critical;
            let b_critical = b.tier() == Priority::Critical;
            b_critical
                .cmp(&a_critical)
                .then_with(|| sb.total_cmp(sa))
                .then_with(|| tie_break(a, b))
        });
        scored.into_iter().take(slots).map(|(t, _)| t.id).collect()
    }

    /// After the algorithm picks seeds, greedily pull each seed's
    /// batch-mates in right behind it, up to the slot count. Later
    /// algorithm picks that no longer fit are dropped.
    fn expand_batches(&self, picks: &mut Vec<TaskId>, candidates: &[Task], slots: usize) {
        let by_id: HashMap<TaskId, &Task> = candidates.iter().map(|t| (t.id, t)).collect();
        let mut result: Vec<TaskId> = Vec::new();
        let mut used: HashSet<TaskId> = HashSet::new();

        for seed_id in picks.iter() {
            if result.len() >= slots {
                break;
            }
            if !used.insert(*seed_id) {
                continue;
            }
            result.push(*seed_id);

            let Some(seed) = by_id.get(seed_id) else {
                continue;
            };
            let Some(group) = &seed.batch_group else {
                continue;
            };
            if !seed.batch_compatible {
                continue;
            }
            let mut mates: Vec<&&Task> = by_id
                .values()
                .filter(|t| {
                    t.batch_compatible
                        && t.batch_group.as_deref() == Some(group.as_str())
                        && !used.contains(&t.id)
                })
                .collect();
            mates.sort_by(|a, b| tie_break(a, b));
            for mate in mates {
                if result.len() >= slots {
                    break;
                }
                used.insert(mate.id);
                result.push(mate.id);
            }
        }
        *picks = result;
    }
}
