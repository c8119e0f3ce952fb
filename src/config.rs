//! Engine configuration
//!
//! Configuration follows the same conventions as the rest of the fabric's
//! structs: plain serde types with `Default` impls and integer `_secs`/`_ms`
//! duration fields, loadable from TOML. Every engine instance owns its own
//! configuration; nothing here is process-global.

use crate::types::{FabricError, FabricResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Task selection algorithm used by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingAlgorithm {
    /// Rotate through priority tiers, one pick per tier per pass
    RoundRobin,
    /// Per-tier token buckets with weights proportional to base priority
    WeightedFair,
    /// Shortest deadline slack first; the critical tier stays absolute
    DeadlineAware,
    /// First-fit-decreasing packing by dominant resource footprint
    ResourceAware,
    /// Rank by `P(success) / predicted_duration` from the predictor
    MlOptimized,
    /// Switch among the above based on load and deadline pressure
    Hybrid,
}

impl Default for SchedulingAlgorithm {
    fn default() -> Self {
        SchedulingAlgorithm::WeightedFair
    }
}

/// Policy applied when two sessions have written the same task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Last writer wins on `updated_at`
    Timestamp,
    /// Keep the local version and surface a conflict event
    Manual,
    /// Field-level merge: furthest status wins, metrics union
    Merge,
}

impl Default for ConflictResolution {
    fn default() -> Self {
        ConflictResolution::Timestamp
    }
}

/// Weights of the six dynamic-priority factors
///
/// Signs are contractual (all additive); magnitudes are tuning knobs.
/// The resulting score is clamped to `[base/2, base*4]` regardless.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityWeights {
    /// Points per second of queue age
    pub age_weight: f64,
    /// Multiplier for caller importance in `[0, 1]`
    pub user_weight: f64,
    /// Multiplier for category criticality in `[0, 1]`
    pub criticality_weight: f64,
    /// Points per hop of the longest hard-dependency chain
    pub dep_weight: f64,
    /// Multiplier for the resource-availability score in `[0, 1]`
    pub resource_weight: f64,
    /// Multiplier for the historical success rate in `[0, 1]`
    pub history_weight: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            age_weight: 0.05,
            user_weight: 100.0,
            criticality_weight: 100.0,
            dep_weight: 10.0,
            resource_weight: 50.0,
            history_weight: 50.0,
        }
    }
}

/// Tunables of the store's read/write paths
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Maximum records held in the read cache
    pub cache_size: usize,
    /// Write-buffer flush threshold (records)
    pub batch_size: usize,
    /// Buffer writes and flush in batches instead of write-through
    pub async_writes: bool,
    /// Warm the read cache from disk at session boot
    pub prefetch_enabled: bool,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            cache_size: 1024,
            batch_size: 64,
            async_writes: false,
            prefetch_enabled: true,
        }
    }
}

/// Persistence and crash-recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Master switch; when false the engine runs fully in memory
    pub enabled: bool,
    /// Root directory of the on-disk layout
    pub root: PathBuf,
    /// Gzip record files on disk
    pub compression: bool,
    /// Terminal tasks older than this are eligible for cleanup
    pub retention_days: u32,
    /// Session `last_activity` rewrite period
    pub heartbeat_interval_secs: u64,
    /// Automatic checkpoint period
    pub checkpoint_interval_secs: u64,
    /// Automatic checkpoints retained (manual ones are never evicted)
    pub max_checkpoints: usize,
    /// Sessions silent longer than this are considered crashed
    pub session_timeout_secs: u64,
    /// Restore crashed sessions' checkpoints at boot
    pub crash_recovery_enabled: bool,
    pub conflict_resolution: ConflictResolution,
    pub performance: PerformanceConfig,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: PathBuf::from(".taskfabric"),
            compression: false,
            retention_days: 30,
            heartbeat_interval_secs: 10,
            checkpoint_interval_secs: 60,
            max_checkpoints: 10,
            session_timeout_secs: 120,
            crash_recovery_enabled: true,
            conflict_resolution: ConflictResolution::Timestamp,
            performance: PerformanceConfig::default(),
        }
    }
}

impl PersistenceConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

/// Top-level engine configuration
///
/// # Examples
/// ```
/// use taskfabric::{EngineConfig, SchedulingAlgorithm};
///
/// let config = EngineConfig {
///     max_concurrent_tasks: 8,
///     scheduling_algorithm: SchedulingAlgorithm::Hybrid,
///     ..Default::default()
/// };
/// assert_eq!(config.max_retries, 3);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker pool cap; running tasks never exceed this
    pub max_concurrent_tasks: usize,
    /// Default retries per task (spec may override per task)
    pub max_retries: u32,
    /// Default wall-clock bound per execution, in milliseconds
    pub default_timeout_ms: u64,
    /// Scheduler tick period
    pub tick_interval_ms: u64,
    /// Dynamic-priority re-scoring period
    pub priority_adjustment_interval_secs: u64,
    /// Queued age that triggers the one-shot starvation boost
    pub max_starvation_time_secs: u64,
    /// Grace window between a cancel signal and forced abandonment
    pub cancel_grace_ms: u64,
    pub scheduling_algorithm: SchedulingAlgorithm,
    pub enable_batching: bool,
    /// Gate for predictor-driven selection; when off, ML-optimized
    /// scheduling falls back to weighted-fair
    pub enable_smart_scheduling: bool,
    /// Gate for automatic retention cleanup of old terminal tasks
    pub enable_queue_optimization: bool,
    /// `submit` fails with `QueueFull` at this many non-terminal tasks
    pub queue_high_water_mark: usize,
    /// Resource pools declared at construction: name → capacity
    pub resource_pools: HashMap<String, u64>,
    pub priority_weights: PriorityWeights,
    pub persistence: PersistenceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 4,
            max_retries: 3,
            default_timeout_ms: 300_000,
            tick_interval_ms: 100,
            priority_adjustment_interval_secs: 30,
            max_starvation_time_secs: 300,
            cancel_grace_ms: 2_000,
            scheduling_algorithm: SchedulingAlgorithm::default(),
            enable_batching: false,
            enable_smart_scheduling: true,
            enable_queue_optimization: true,
            queue_high_water_mark: 10_000,
            resource_pools: HashMap::new(),
            priority_weights: PriorityWeights::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> FabricResult<Self> {
        toml::from_str(text).map_err(|e| FabricError::Validation(format!("config: {e}")))
    }

    /// Load a configuration from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> FabricResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn max_starvation_time(&self) -> Duration {
        Duration::from_secs(self.max_starvation_time_secs)
    }
}
