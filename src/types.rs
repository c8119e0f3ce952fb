//! Core type definitions for the task fabric
//!
//! This module defines the central data structures shared by every
//! component: tasks, priority tiers, the status state machine, dependency
//! edges, per-task metrics, and the crate-wide error type.
//!
//! All persisted types implement serde serialization; runtime-only handles
//! (execute/validate/rollback routines, cancellation tokens) are kept out
//! of these records and live in the executor's registries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for tasks in the fabric
pub type TaskId = Uuid;

/// Priority tiers for task scheduling
///
/// Higher values indicate higher priority. The scheduler compares tiers
/// before dynamic scores, so a `Critical` task can never be overtaken by a
/// task from a lower tier regardless of score adjustments.
///
/// # Examples
/// ```
/// use taskfabric::Priority;
///
/// assert!(Priority::Critical > Priority::Background);
/// assert_eq!(Priority::Medium.score(), 500.0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// Mission-critical tasks that must execute before anything else
    Critical = 1000,
    /// High-priority tasks for important operations
    High = 800,
    /// Standard priority for regular tasks
    Medium = 500,
    /// Low-priority tasks that can wait
    Low = 200,
    /// Background tasks with minimal priority
    Background = 50,
}

impl Priority {
    /// Numeric base score of the tier
    pub fn score(&self) -> f64 {
        *self as u16 as f64
    }

    /// All tiers, highest first (scheduler rotation order)
    pub const TIERS: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
        Priority::Background,
    ];
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (*self as u16).cmp(&(*other as u16))
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

/// Work category of a task
///
/// Feeds the `system_criticality` priority factor and groups execution
/// history for the moving-average predictor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Feature,
    BugFix,
    Test,
    Documentation,
    Refactor,
    Security,
    Performance,
    Infrastructure,
}

impl TaskCategory {
    /// Criticality signal in `[0, 1]`, security work highest
    pub fn system_criticality(&self) -> f64 {
        match self {
            TaskCategory::Security => 1.0,
            TaskCategory::BugFix => 0.8,
            TaskCategory::Performance => 0.7,
            TaskCategory::Infrastructure => 0.6,
            TaskCategory::Feature => 0.5,
            TaskCategory::Test => 0.4,
            TaskCategory::Refactor => 0.3,
            TaskCategory::Documentation => 0.2,
        }
    }
}

impl Default for TaskCategory {
    fn default() -> Self {
        TaskCategory::Feature
    }
}

/// Lifecycle state of a task
///
/// ```text
/// PENDING → QUEUED → RUNNING → {COMPLETED | FAILED | CANCELLED}
///    ↑        ↕  ↖______ PENDING_RETRY (retryable failure)
///    └──── BLOCKED (unsatisfied dependency / pre-condition)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted, dependencies not yet evaluated
    Pending,
    /// Eligible for dispatch
    Queued,
    /// Currently executing; also present in the executor's active set
    Running,
    /// Waiting on an unsatisfied dependency or pre-condition
    Blocked,
    /// Failed retryably; returns to `Queued` after backoff
    PendingRetry,
    /// Finished successfully
    Completed,
    /// Failed terminally
    Failed,
    /// Cancelled before completion
    Cancelled,
}

impl TaskStatus {
    /// True for the three terminal states
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Progress rank in the state machine, used by the `merge` conflict
    /// resolution policy ("more advanced" state wins)
    pub fn rank(&self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Blocked => 1,
            TaskStatus::Queued => 2,
            TaskStatus::PendingRetry => 3,
            TaskStatus::Running => 4,
            TaskStatus::Cancelled => 5,
            TaskStatus::Failed => 6,
            TaskStatus::Completed => 7,
        }
    }
}

/// Kind of a dependency edge between two tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Hard edge: the dependent cannot run until the source is completed
    Blocks,
    /// Soft edge: completion of the source boosts the dependent's priority
    Enables,
    /// The two endpoints may not run simultaneously
    Conflicts,
    /// Soft edge, weaker boost than `Enables`
    Enhances,
}

impl DependencyKind {
    /// True for edges that gate readiness (`Blocks`)
    pub fn is_hard(&self) -> bool {
        matches!(self, DependencyKind::Blocks)
    }

    /// True for edges that only feed the priority engine
    pub fn is_soft(&self) -> bool {
        matches!(self, DependencyKind::Enables | DependencyKind::Enhances)
    }
}

/// Typed dependency edge `from → to`
///
/// For `Blocks`, `to` waits on `from`. `optional` edges are ignored when
/// the source task no longer exists or was cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: TaskId,
    pub to: TaskId,
    pub kind: DependencyKind,
    pub optional: bool,
}

/// The six named inputs of the dynamic priority score
///
/// Recomputed by the priority engine on submission, on the adjustment
/// interval, and when a soft-edge source completes. Persisted with the
/// task for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PriorityFactors {
    /// Seconds spent since creation (monotonically increasing)
    pub age: f64,
    /// Caller-provided importance in `[0, 1]`
    pub user_importance: f64,
    /// Derived from the task category, security highest
    pub system_criticality: f64,
    /// Longest hard-dependency chain ending at this task
    pub dependency_weight: f64,
    /// 1.0 when required resources are free, 0.0 when starved
    pub resource_availability: f64,
    /// Success rate of similar (same-category) tasks
    pub execution_history: f64,
}

/// One attempt in a task's retry history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// 1-based attempt number
    pub attempt: u32,
    pub at: DateTime<Utc>,
    pub error_kind: ErrorKind,
    pub message: String,
}

/// Per-task execution metrics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Time spent between submission and first dispatch
    pub wait_ms: Option<u64>,
    /// Wall-clock execution time of the last attempt
    pub duration_ms: Option<u64>,
    pub retry_count: u32,
    pub cpu_seconds: Option<f64>,
    pub memory_peak_mb: Option<f64>,
    pub result_size_bytes: Option<u64>,
}

/// The central task record
///
/// Everything here is serializable and survives restarts. The execution
/// routine itself is registered separately with the executor; a restored
/// task whose routine was not re-registered fails its next dispatch with a
/// validation error instead of panicking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier, assigned on submit
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub category: TaskCategory,
    pub tags: Vec<String>,

    /// Tier; compared before any score
    pub base_priority: Priority,
    /// Recomputed score, clamped to `[base/2, base*4]`
    pub dynamic_priority: f64,
    /// One-shot starvation relief: the tier this task was raised to
    pub boosted_tier: Option<Priority>,
    pub priority_factors: PriorityFactors,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// First time the task became eligible for dispatch
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    /// Set exactly when the task reaches a terminal state
    pub completed_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub estimated_duration_ms: u64,
    pub actual_duration_ms: Option<u64>,
    /// Per-task execution timeout override
    pub timeout_ms: Option<u64>,

    pub max_retries: u32,
    pub current_retries: u32,
    /// Earliest instant the next retry attempt may be dispatched
    pub next_attempt_at: Option<DateTime<Utc>>,

    pub status: TaskStatus,

    /// Ids this task waits on (hard dependencies)
    pub dependencies: Vec<TaskId>,
    /// Ids waiting on this task
    pub dependents: Vec<TaskId>,

    /// Names of the pools this task draws from
    pub required_resources: Vec<String>,
    /// Pool name → units reserved for the duration of execution
    pub resource_constraints: HashMap<String, u64>,

    /// Guard expressions checked before dispatch
    pub pre_conditions: Vec<String>,
    /// Expressions checked after a successful execution
    pub post_conditions: Vec<String>,

    pub batch_compatible: bool,
    pub batch_group: Option<String>,

    /// Caller-provided importance in `[0, 1]`
    pub user_importance: f64,
    /// Set when this task was emitted by another task's execution
    pub parent_task_id: Option<TaskId>,

    pub last_error: Option<String>,
    pub retry_history: Vec<RetryAttempt>,
    pub metrics: TaskMetrics,

    /// Opaque caller context; the core never branches on its contents
    pub metadata: HashMap<String, String>,
}

impl Task {
    /// Tier used for scheduling comparisons: the base tier, raised by a
    /// starvation boost when one was applied
    pub fn tier(&self) -> Priority {
        match self.boosted_tier {
            Some(boost) => boost.max(self.base_priority),
            None => self.base_priority,
        }
    }

    /// Remaining deadline slack normalized by the duration estimate.
    /// `None` when the task has no deadline.
    pub fn deadline_slack(&self, now: DateTime<Utc>) -> Option<f64> {
        let deadline = self.deadline?;
        let remaining_ms = (deadline - now).num_milliseconds() as f64;
        let estimate = self.estimated_duration_ms.max(1) as f64;
        Some(remaining_ms / estimate)
    }

    /// Effective execution timeout for this task
    pub fn effective_timeout(&self, default_ms: u64) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(default_ms))
    }

    /// Largest fraction of any single pool this task consumes
    pub fn dominant_resource_share(&self, totals: &HashMap<String, u64>) -> f64 {
        self.resource_constraints
            .iter()
            .map(|(name, amount)| {
                let total = totals.get(name).copied().unwrap_or(0).max(1);
                *amount as f64 / total as f64
            })
            .fold(0.0, f64::max)
    }
}

/// Discriminant of the error taxonomy, carried on events and in retry
/// history entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    CycleDetected,
    NotFound,
    BusyTransaction,
    Integrity,
    ResourceUnavailable,
    PreConditionFailed,
    Timeout,
    Execution,
    Cancelled,
    QueueFull,
    Shutdown,
    Io,
    Serialization,
    Internal,
}

/// Error type for all fabric operations
///
/// Locally-recoverable kinds (`ResourceUnavailable`, `PreConditionFailed`,
/// `BusyTransaction`) are retried by the scheduler on the next tick and
/// never surface to callers; the rest propagate through results or
/// `task-failed` events.
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    /// Invalid task spec; submission rejected synchronously
    #[error("invalid task spec: {0}")]
    Validation(String),

    /// The dependency would introduce a hard-edge cycle
    #[error("dependency cycle detected: {path:?}")]
    CycleDetected {
        /// Offending cycle, first id repeated at the end
        path: Vec<TaskId>,
    },

    /// Task, session, or checkpoint missing
    #[error("not found: {0}")]
    NotFound(String),

    /// Transactional conflict on a staged record; retryable
    #[error("record staged by concurrent transaction {0}")]
    BusyTransaction(Uuid),

    /// Persisted record failed its content-hash check
    #[error("integrity check failed for {record}: expected {expected}, got {actual}")]
    Integrity {
        record: String,
        expected: String,
        actual: String,
    },

    /// Ledger rejected a reservation; scheduler retries next tick
    #[error("resource pool `{pool}` unavailable: need {needed}, {available} free")]
    ResourceUnavailable {
        pool: String,
        needed: u64,
        available: u64,
    },

    /// A pre-condition guard did not pass
    #[error("pre-condition failed: {0}")]
    PreConditionFailed(String),

    /// Execution overran its wall-clock deadline
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    /// Caller-supplied routine failed
    #[error("execution failed: {message}")]
    Execution { message: String, retryable: bool },

    /// Cooperative cancellation was requested
    #[error("cancellation requested")]
    Cancelled,

    /// Backpressure: the queue is at its high-water mark
    #[error("queue full: {0} tasks in flight")]
    QueueFull(usize),

    /// Operation rejected after shutdown was initiated
    #[error("engine is shutting down")]
    Shutdown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FabricError {
    /// Taxonomy discriminant of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            FabricError::Validation(_) => ErrorKind::Validation,
            FabricError::CycleDetected { .. } => ErrorKind::CycleDetected,
            FabricError::NotFound(_) => ErrorKind::NotFound,
            FabricError::BusyTransaction(_) => ErrorKind::BusyTransaction,
            FabricError::Integrity { .. } => ErrorKind::Integrity,
            FabricError::ResourceUnavailable { .. } => ErrorKind::ResourceUnavailable,
            FabricError::PreConditionFailed(_) => ErrorKind::PreConditionFailed,
            FabricError::Timeout(_) => ErrorKind::Timeout,
            FabricError::Execution { .. } => ErrorKind::Execution,
            FabricError::Cancelled => ErrorKind::Cancelled,
            FabricError::QueueFull(_) => ErrorKind::QueueFull,
            FabricError::Shutdown => ErrorKind::Shutdown,
            FabricError::Io(_) => ErrorKind::Io,
            FabricError::Serialization(_) => ErrorKind::Serialization,
            FabricError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a failed execution with this error consumes a retry
    /// instead of failing terminally
    pub fn is_retryable(&self) -> bool {
        match self {
            FabricError::BusyTransaction(_)
            | FabricError::ResourceUnavailable { .. }
            | FabricError::Timeout(_) => true,
            FabricError::Execution { retryable, .. } => *retryable,
            FabricError::Io(_) => true,
            _ => false,
        }
    }
}

impl From<anyhow::Error> for FabricError {
    fn from(err: anyhow::Error) -> Self {
        FabricError::Execution {
            message: format!("{err:#}"),
            retryable: true,
        }
    }
}

impl From<validator::ValidationErrors> for FabricError {
    fn from(err: validator::ValidationErrors) -> Self {
        FabricError::Validation(err.to_string())
    }
}

/// Result type alias for fabric operations
pub type FabricResult<T> = Result<T, FabricError>;
