//! Queue-level metrics
//!
//! In-process aggregation only; exporting is a caller concern. The
//! collector is owned by the engine and updated from the completion
//! handler, so snapshots are always consistent with the task table.

use crate::resources::PoolUsage;
use crate::types::{Priority, TaskCategory};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Point-in-time metrics snapshot returned by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub queued: usize,
    pub running: usize,
    /// Completions per minute since the collector started
    pub throughput_per_min: f64,
    /// `completed / (completed + failed)`; 1.0 when nothing finished yet
    pub success_rate: f64,
    pub mean_wait_ms_by_tier: HashMap<String, f64>,
    pub mean_exec_ms_by_category: HashMap<String, f64>,
    /// Jain's index over per-tier throughput, logged each tick
    pub fairness_index: f64,
    pub pool_usage: HashMap<String, PoolUsage>,
}

#[derive(Debug, Default, Clone, Copy)]
struct RunningMean {
    sum: f64,
    count: u64,
}

impl RunningMean {
    fn push(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Accumulates task lifecycle observations
pub struct MetricsCollector {
    started_at: DateTime<Utc>,
    submitted: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    wait_by_tier: HashMap<Priority, RunningMean>,
    exec_by_category: HashMap<TaskCategory, RunningMean>,
    fairness_index: f64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            submitted: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            wait_by_tier: HashMap::new(),
            exec_by_category: HashMap::new(),
            fairness_index: 1.0,
        }
    }

    pub fn record_submitted(&mut self) {
        self.submitted += 1;
    }

    pub fn record_completed(
        &mut self,
        tier: Priority,
        category: TaskCategory,
        wait_ms: u64,
        exec_ms: u64,
    ) {
        self.completed += 1;
        self.wait_by_tier.entry(tier).or_default().push(wait_ms as f64);
        self.exec_by_category
            .entry(category)
            .or_default()
            .push(exec_ms as f64);
    }

    pub fn record_failed(&mut self) {
        self.failed += 1;
    }

    pub fn record_cancelled(&mut self) {
        self.cancelled += 1;
    }

    pub fn set_fairness(&mut self, index: f64) {
        self.fairness_index = index;
    }

    /// Build a snapshot, combining internal counters with the live
    /// queue/running counts and pool usage supplied by the engine
    pub fn snapshot(
        &self,
        queued: usize,
        running: usize,
        pool_usage: HashMap<String, PoolUsage>,
    ) -> QueueMetrics {
        let minutes = (Utc::now() - self.started_at).num_milliseconds() as f64 / 60_000.0;
        let throughput_per_min = if minutes > 0.0 {
            self.completed as f64 / minutes
        } else {
            0.0
        };
        let finished = self.completed + self.failed;
        let success_rate = if finished == 0 {
            1.0
        } else {
            self.completed as f64 / finished as f64
        };

        QueueMetrics {
            submitted: self.submitted,
            completed: self.completed,
            failed: self.failed,
            cancelled: self.cancelled,
            queued,
            running,
            throughput_per_min,
            success_rate,
            mean_wait_ms_by_tier: self
                .wait_by_tier
                .iter()
                .map(|(tier, mean)| (format!("{tier:?}").to_lowercase(), mean.mean()))
                .collect(),
            mean_exec_ms_by_category: self
                .exec_by_category
                .iter()
                .map(|(cat, mean)| (format!("{cat:?}").to_lowercase(), mean.mean()))
                .collect(),
            fairness_index: self.fairness_index,
            pool_usage,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
