//! taskfabric — autonomous task scheduling and execution core
//!
//! This library accepts user-submitted units of work, orders them under
//! multi-factor priority with dependency and resource constraints,
//! executes them concurrently under a bounded worker budget, and
//! preserves their state across process restarts with crash-recovery
//! guarantees.
//!
//! ## Key components
//!
//! - **Store**: durable task/checkpoint records with integrity hashing
//! - **Dependency graph**: typed edges, cycle rejection, readiness
//! - **Resource ledger**: named capacity pools with atomic reservation
//! - **Priority engine**: six-factor dynamic scores with starvation relief
//! - **Scheduler**: six selection algorithms behind one tick loop
//! - **Executor**: bounded worker pool with timeouts, retries, and
//!   cooperative cancellation
//! - **Persistence engine**: sessions, heartbeats, checkpoints, crash
//!   recovery
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   submit    ┌─────────────────────────────────────┐
//! │  Callers  │────────────▶│             TaskEngine              │
//! └───────────┘             │  ┌────────┐ ┌─────────┐ ┌────────┐  │
//!       ▲ events            │  │ Graph  │ │ Ledger  │ │Priority│  │
//!       └───────────────────│  └────────┘ └─────────┘ └────────┘  │
//!                           │  ┌─────────┐ ┌────────┐ ┌────────┐  │
//!                           │  │Scheduler│ │Executor│ │ Store/ │  │
//!                           │  └─────────┘ └────────┘ │Persist │  │
//!                           │                         └────────┘  │
//!                           └─────────────────────────────────────┘
//! ```
//!
//! A single scheduler loop drives ticks; a worker pool executes up to
//! `max_concurrent_tasks` routines in parallel; completions flow back
//! over a channel and are applied by one handler, so task state
//! transitions are serialized.
//!
//! ## Example
//!
//! ```rust,no_run
//! use taskfabric::{EngineConfig, ExecutionOutput, TaskEngine, TaskSpec, routine_fn};
//!
//! #[tokio::main]
//! async fn main() -> taskfabric::FabricResult<()> {
//!     let engine = TaskEngine::new(EngineConfig::default()).await?;
//!
//!     let spec = TaskSpec::builder(
//!         "warm cache",
//!         "prime the query cache before launch",
//!         routine_fn(|_task, _ctx| async move { Ok(ExecutionOutput::success()) }),
//!     )
//!     .build()?;
//!
//!     let id = engine.submit(spec).await?;
//!     println!("submitted {id}");
//!     engine.shutdown(None).await?;
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs, clippy::all)]

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub mod config;
pub mod events;
pub mod executor;
pub mod graph;
pub mod metrics;
pub mod persistence;
pub mod priority;
pub mod resources;
pub mod scheduler;
pub mod spec;
pub mod store;
pub mod types;

pub use config::{
    ConflictResolution, EngineConfig, PerformanceConfig, PersistenceConfig, PriorityWeights,
    SchedulingAlgorithm,
};
pub use events::{EventHub, FabricEvent};
pub use executor::{Completion, TaskOutcome};
pub use graph::DependencyGraph;
pub use metrics::QueueMetrics;
pub use persistence::{
    Checkpoint, CheckpointKind, PersistenceEngine, QueueState, SessionMetadata, SessionState,
};
pub use priority::{MovingAveragePredictor, PriorityEngine};
pub use resources::{PoolUsage, ResourceLedger};
pub use scheduler::{Scheduler, SelectionContext};
pub use spec::{
    routine_fn, DecompositionPolicy, ExecutionContext, ExecutionOutput, Prediction, ProgressFn,
    TaskPredictor, TaskRoutine, TaskSpec, TaskSpecBuilder,
};
pub use store::FileTaskStore;
pub use types::{
    DependencyEdge, DependencyKind, ErrorKind, FabricError, FabricResult, Priority,
    PriorityFactors, RetryAttempt, Task, TaskCategory, TaskId, TaskMetrics, TaskStatus,
};

use crate::executor::{retry_backoff, Executor};
use crate::metrics::MetricsCollector;
use crate::spec::conditions_pass;

/// Version of the fabric library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Filter for [`TaskEngine::list_tasks`]
#[derive(Debug, Default, Clone)]
pub struct TaskFilter {
    /// Match a specific status
    pub status: Option<TaskStatus>,
    /// Match a category
    pub category: Option<TaskCategory>,
    /// Match a base-priority tier
    pub tier: Option<Priority>,
    /// Match tasks carrying this tag
    pub tag: Option<String>,
}

impl TaskFilter {
    fn matches(&self, task: &Task) -> bool {
        self.status.map(|s| task.status == s).unwrap_or(true)
            && self.category.map(|c| task.category == c).unwrap_or(true)
            && self.tier.map(|t| task.base_priority == t).unwrap_or(true)
            && self
                .tag
                .as_ref()
                .map(|tag| task.tags.iter().any(|t| t == tag))
                .unwrap_or(true)
    }
}

struct RuntimeHandles {
    routine: Arc<dyn TaskRoutine>,
    progress: Option<ProgressFn>,
}

struct EngineInner {
    config: EngineConfig,
    tasks: RwLock<HashMap<TaskId, Task>>,
    handles: RwLock<HashMap<TaskId, RuntimeHandles>>,
    graph: RwLock<DependencyGraph>,
    ledger: RwLock<ResourceLedger>,
    priority: RwLock<PriorityEngine>,
    scheduler: RwLock<Scheduler>,
    executor: Executor,
    persistence: Option<PersistenceEngine>,
    events: EventHub,
    metrics: RwLock<MetricsCollector>,
    paused: RwLock<bool>,
    shutting_down: RwLock<bool>,
    /// Edge detector for the queue-drained event
    drained: RwLock<bool>,
    /// Optional pluggable task-breakdown policy
    decomposer: RwLock<Option<Arc<dyn DecompositionPolicy>>>,
    cancel_root: CancellationToken,
}

/// The task fabric's public API surface
///
/// One engine instance owns its timers, caches, and background loops;
/// dropping it after [`TaskEngine::shutdown`] releases everything.
pub struct TaskEngine {
    inner: Arc<EngineInner>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskEngine {
    /// Boot an engine: open persistence, run crash recovery, start the
    /// scheduler/completion/adjustment loops
    pub async fn new(config: EngineConfig) -> FabricResult<Self> {
        if config.max_concurrent_tasks == 0 {
            return Err(FabricError::Validation(
                "max_concurrent_tasks must be at least 1".into(),
            ));
        }

        let priority = PriorityEngine::new(config.priority_weights);
        let predictor = priority.predictor();
        let scheduler = Scheduler::new(
            config.scheduling_algorithm,
            config.enable_batching,
            config.enable_smart_scheduling,
            predictor,
        );
        let (executor, completion_rx) = Executor::new(
            config.max_concurrent_tasks,
            Duration::from_millis(config.cancel_grace_ms),
        );

        let persistence = if config.persistence.enabled {
            Some(PersistenceEngine::new(config.persistence.clone()).await?)
        } else {
            None
        };

        let inner = Arc::new(EngineInner {
            ledger: RwLock::new(ResourceLedger::new(&config.resource_pools)),
            tasks: RwLock::new(HashMap::new()),
            handles: RwLock::new(HashMap::new()),
            graph: RwLock::new(DependencyGraph::new()),
            priority: RwLock::new(priority),
            scheduler: RwLock::new(scheduler),
            executor,
            persistence,
            events: EventHub::default(),
            metrics: RwLock::new(MetricsCollector::new()),
            paused: RwLock::new(false),
            shutting_down: RwLock::new(false),
            drained: RwLock::new(true),
            decomposer: RwLock::new(None),
            cancel_root: CancellationToken::new(),
            config,
        });

        if let Some(persistence) = &inner.persistence {
            let report = persistence.boot_recovery().await?;
            if !report.tasks.is_empty() || !report.crashed_sessions.is_empty() {
                let recovered = report.tasks.len();
                {
                    let mut graph = inner.graph.write().await;
                    for edge in &report.edges {
                        // Edges came from a previously consistent graph.
                        if let Err(e) = graph.add_edge(edge.from, edge.to, edge.kind, edge.optional)
                        {
                            warn!(error = %e, "restored edge dropped");
                        }
                    }
                }
                *inner.tasks.write().await = report.tasks;
                *inner.drained.write().await = false;
                for session_id in report.crashed_sessions {
                    inner.events.emit(FabricEvent::CrashRecovery {
                        session_id,
                        recovered,
                    });
                }
                for task_id in report.conflicts {
                    inner.events.emit(FabricEvent::ConflictDetected { task_id });
                }
                info!(recovered, "previous session state restored");
            }
        }

        let engine = Self {
            inner: Arc::clone(&inner),
            loops: Mutex::new(Vec::new()),
        };
        engine.start_loops(completion_rx).await;
        Ok(engine)
    }

    async fn start_loops(&self, completion_rx: async_channel::Receiver<Completion>) {
        let mut loops = self.loops.lock().await;

        // Scheduler tick loop
        {
            let inner = Arc::clone(&self.inner);
            loops.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(inner.config.tick_interval());
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                info!("scheduler loop started");
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let Err(e) = run_tick(&inner).await {
                                error!(error = %e, "scheduler tick failed");
                            }
                        }
                        _ = inner.cancel_root.cancelled() => break,
                    }
                }
                info!("scheduler loop stopped");
            }));
        }

        // Completion loop
        {
            let inner = Arc::clone(&self.inner);
            loops.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        completion = completion_rx.recv() => match completion {
                            Ok(completion) => handle_completion(&inner, completion).await,
                            Err(_) => break,
                        },
                        _ = inner.cancel_root.cancelled() => break,
                    }
                }
            }));
        }

        // Priority adjustment loop
        {
            let inner = Arc::clone(&self.inner);
            loops.push(tokio::spawn(async move {
                let period =
                    Duration::from_secs(inner.config.priority_adjustment_interval_secs.max(1));
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => readjust_priorities(&inner).await,
                        _ = inner.cancel_root.cancelled() => break,
                    }
                }
            }));
        }

        if self.inner.persistence.is_some() {
            // Heartbeat loop (also drains the write buffer opportunistically)
            {
                let inner = Arc::clone(&self.inner);
                loops.push(tokio::spawn(async move {
                    let period = inner.config.persistence.heartbeat_interval();
                    let mut interval = tokio::time::interval(period);
                    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    loop {
                        tokio::select! {
                            _ = interval.tick() => {
                                if let Some(p) = &inner.persistence {
                                    if let Err(e) = p.heartbeat().await {
                                        warn!(error = %e, "heartbeat write failed");
                                    }
                                    if let Err(e) = p.store().flush().await {
                                        warn!(error = %e, "write buffer flush failed");
                                    }
                                }
                                if inner.config.enable_queue_optimization {
                                    let retention =
                                        chrono::Duration::days(inner.config.persistence.retention_days as i64);
                                    if let Err(e) = cleanup_terminal(&inner, Utc::now() - retention).await {
                                        warn!(error = %e, "retention cleanup failed");
                                    }
                                }
                            }
                            _ = inner.cancel_root.cancelled() => break,
                        }
                    }
                }));
            }

            // Checkpoint loop
            {
                let inner = Arc::clone(&self.inner);
                loops.push(tokio::spawn(async move {
                    let period = inner.config.persistence.checkpoint_interval();
                    let mut interval = tokio::time::interval(period);
                    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    // Skip the immediate first tick.
                    interval.tick().await;
                    loop {
                        tokio::select! {
                            _ = interval.tick() => {
                                if let Err(e) = write_checkpoint(&inner, CheckpointKind::Automatic).await {
                                    warn!(error = %e, "periodic checkpoint failed");
                                }
                            }
                            _ = inner.cancel_root.cancelled() => break,
                        }
                    }
                }));
            }
        }
    }

    /// Submit a task for scheduling and return its id
    pub async fn submit(&self, spec: TaskSpec) -> FabricResult<TaskId> {
        submit_spec(&self.inner, spec, None).await
    }

    /// Install a task-breakdown policy.
    ///
    /// After each submission the policy is offered the new task; any
    /// subtask specs it returns are submitted with `parent_task_id` set.
    pub async fn set_decomposition_policy(&self, policy: Arc<dyn DecompositionPolicy>) {
        *self.inner.decomposer.write().await = Some(policy);
    }

    /// Re-attach an execution routine to an existing task.
    ///
    /// Routines are runtime handles and are not persisted, so tasks
    /// restored by crash recovery need their routines registered again
    /// before they can dispatch. Returns false for unknown or terminal
    /// tasks.
    pub async fn register_routine(&self, id: TaskId, routine: Arc<dyn TaskRoutine>) -> bool {
        let known = {
            let tasks = self.inner.tasks.read().await;
            tasks
                .get(&id)
                .map(|t| !t.status.is_terminal())
                .unwrap_or(false)
        };
        if !known {
            return false;
        }
        self.inner.handles.write().await.insert(
            id,
            RuntimeHandles {
                routine,
                progress: None,
            },
        );
        true
    }

    /// Register a typed dependency between two existing tasks.
    ///
    /// `dependent` waits on (or conflicts/associates with) `depends_on`.
    /// Fails with `CycleDetected` when a hard edge would close a cycle.
    pub async fn add_dependency(
        &self,
        dependent: TaskId,
        depends_on: TaskId,
        kind: DependencyKind,
        optional: bool,
    ) -> FabricResult<()> {
        let inner = &self.inner;
        {
            let tasks = inner.tasks.read().await;
            for id in [dependent, depends_on] {
                if !tasks.contains_key(&id) {
                    return Err(FabricError::NotFound(format!("task {id}")));
                }
            }
        }

        inner
            .graph
            .write()
            .await
            .add_edge(depends_on, dependent, kind, optional)?;

        let (dep_copy, src_copy) = {
            let mut tasks = inner.tasks.write().await;
            if kind == DependencyKind::Blocks {
                if let Some(task) = tasks.get_mut(&dependent) {
                    if !task.dependencies.contains(&depends_on) {
                        task.dependencies.push(depends_on);
                    }
                    task.updated_at = Utc::now();
                }
                if let Some(task) = tasks.get_mut(&depends_on) {
                    if !task.dependents.contains(&dependent) {
                        task.dependents.push(dependent);
                    }
                    task.updated_at = Utc::now();
                }
            }
            (
                tasks.get(&dependent).cloned(),
                tasks.get(&depends_on).cloned(),
            )
        };
        for task in [dep_copy, src_copy].into_iter().flatten() {
            persist_task(inner, &task).await;
        }
        persist_queue(inner).await;
        Ok(())
    }

    /// Cancel a task; returns false when it is already terminal or
    /// unknown. Running tasks are signalled cooperatively.
    pub async fn cancel(&self, id: TaskId, reason: Option<String>) -> bool {
        let inner = &self.inner;
        let status = {
            let tasks = inner.tasks.read().await;
            match tasks.get(&id) {
                Some(task) => task.status,
                None => return false,
            }
        };
        if status.is_terminal() {
            return false;
        }

        if status == TaskStatus::Running {
            // The completion handler finalizes once the routine returns
            // or the grace window expires.
            if let Some(reason) = reason {
                let mut tasks = inner.tasks.write().await;
                if let Some(task) = tasks.get_mut(&id) {
                    task.metadata.insert("cancel_reason".into(), reason);
                }
            }
            return inner.executor.cancel(id).await;
        }

        finalize_cancelled(inner, id, reason, false).await;
        true
    }

    /// Fetch a task by id
    pub async fn get_task(&self, id: TaskId) -> Option<Task> {
        self.inner.tasks.read().await.get(&id).cloned()
    }

    /// List tasks matching the filter (all tasks when `None`)
    pub async fn list_tasks(&self, filter: Option<TaskFilter>) -> Vec<Task> {
        let filter = filter.unwrap_or_default();
        let mut tasks: Vec<Task> = self
            .inner
            .tasks
            .read()
            .await
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tasks.sort_by(scheduler::tie_break);
        tasks
    }

    /// Current queue metrics snapshot
    pub async fn metrics(&self) -> QueueMetrics {
        let inner = &self.inner;
        let (queued, running) = {
            let tasks = inner.tasks.read().await;
            let queued = tasks
                .values()
                .filter(|t| {
                    matches!(
                        t.status,
                        TaskStatus::Pending
                            | TaskStatus::Queued
                            | TaskStatus::Blocked
                            | TaskStatus::PendingRetry
                    )
                })
                .count();
            let running = tasks
                .values()
                .filter(|t| t.status == TaskStatus::Running)
                .count();
            (queued, running)
        };
        let pool_usage = inner.ledger.read().await.snapshot();
        inner
            .metrics
            .read()
            .await
            .snapshot(queued, running, pool_usage)
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FabricEvent> {
        self.inner.events.subscribe()
    }

    /// Stop scheduler ticks; running tasks keep draining
    pub async fn pause(&self) {
        *self.inner.paused.write().await = true;
        info!("scheduler paused");
    }

    /// Resume scheduler ticks
    pub async fn resume(&self) {
        *self.inner.paused.write().await = false;
        info!("scheduler resumed");
    }

    /// Write a manual checkpoint; returns `None` when persistence is
    /// disabled
    pub async fn checkpoint(&self) -> FabricResult<Option<Checkpoint>> {
        write_checkpoint(&self.inner, CheckpointKind::Manual).await
    }

    /// Replace in-memory state with a validated checkpoint snapshot
    pub async fn restore_checkpoint(&self, id: Uuid) -> FabricResult<()> {
        let inner = &self.inner;
        let Some(persistence) = &inner.persistence else {
            return Err(FabricError::NotFound("persistence disabled".into()));
        };
        let checkpoint = persistence.load_checkpoint(id).await?;

        let mut graph = DependencyGraph::new();
        for queue in checkpoint.queue_snapshot.values() {
            for edge in &queue.edges {
                if let Err(e) = graph.add_edge(edge.from, edge.to, edge.kind, edge.optional) {
                    warn!(error = %e, "edge dropped during restore");
                }
            }
        }

        {
            let mut tasks = inner.tasks.write().await;
            let mut graph_slot = inner.graph.write().await;
            let mut ledger = inner.ledger.write().await;
            *tasks = checkpoint.task_snapshot;
            *graph_slot = graph;
            *ledger = ResourceLedger::new(&inner.config.resource_pools);
            for task in tasks.values() {
                if task.status == TaskStatus::Running {
                    if let Err(e) = ledger.try_reserve(task.id, &task.resource_constraints) {
                        warn!(task_id = %task.id, error = %e, "restore could not re-reserve");
                    }
                }
            }
        }
        info!(checkpoint = %id, "state restored from checkpoint");
        Ok(())
    }

    /// Remove terminal tasks older than `older_than` from memory and
    /// the store
    pub async fn cleanup(&self, older_than: chrono::Duration) -> FabricResult<Vec<TaskId>> {
        cleanup_terminal(&self.inner, Utc::now() - older_than).await
    }

    /// Stop accepting work, drain running tasks up to `timeout`, cancel
    /// survivors, write a final checkpoint, and release resources
    pub async fn shutdown(&self, timeout: Option<Duration>) -> FabricResult<()> {
        let inner = &self.inner;
        {
            let mut shutting_down = inner.shutting_down.write().await;
            if *shutting_down {
                return Ok(());
            }
            *shutting_down = true;
        }
        *inner.paused.write().await = true;
        info!("shutdown initiated");

        let deadline = tokio::time::Instant::now() + timeout.unwrap_or(Duration::from_secs(30));
        while inner.executor.running_count().await > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let survivors = inner.executor.cancel_all().await;
        if !survivors.is_empty() {
            warn!(count = survivors.len(), "cancelling tasks at shutdown");
            let grace = Duration::from_millis(inner.config.cancel_grace_ms + 250);
            tokio::time::sleep(grace).await;
            // Anything the completion loop has not finalized by now is
            // recorded as abandoned.
            let leftover: Vec<TaskId> = {
                let tasks = inner.tasks.read().await;
                survivors
                    .into_iter()
                    .filter(|id| {
                        tasks
                            .get(id)
                            .map(|t| !t.status.is_terminal())
                            .unwrap_or(false)
                    })
                    .collect()
            };
            for id in leftover {
                finalize_cancelled(inner, id, Some("shutdown".into()), true).await;
            }
        }

        if let Err(e) = write_checkpoint(inner, CheckpointKind::Automatic).await {
            warn!(error = %e, "final checkpoint failed");
        }
        if let Some(persistence) = &inner.persistence {
            persistence.end_session(SessionState::Terminated).await?;
        }

        inner.cancel_root.cancel();
        let mut loops = self.loops.lock().await;
        for handle in loops.drain(..) {
            handle.abort();
        }
        info!("shutdown complete");
        Ok(())
    }
}

impl Drop for TaskEngine {
    fn drop(&mut self) {
        // Background loops hold the inner Arc; without this they would
        // outlive a facade that was dropped without a clean shutdown.
        self.inner.cancel_root.cancel();
    }
}

/// Submit a built spec, wiring dependencies and the initial score
async fn submit_spec(
    inner: &Arc<EngineInner>,
    spec: TaskSpec,
    parent: Option<TaskId>,
) -> FabricResult<TaskId> {
    if *inner.shutting_down.read().await {
        return Err(FabricError::Shutdown);
    }

    // Backpressure on the non-terminal population.
    {
        let tasks = inner.tasks.read().await;
        let in_flight = tasks.values().filter(|t| !t.status.is_terminal()).count();
        if in_flight >= inner.config.queue_high_water_mark {
            return Err(FabricError::QueueFull(in_flight));
        }
    }

    let id = Uuid::new_v4();
    let routine = spec.routine();
    let progress = spec.progress();
    let mut task = spec.into_task(id, inner.config.max_retries);
    task.parent_task_id = parent;

    // Dependencies must reference known tasks; edges are registered
    // before the task becomes visible to the scheduler.
    {
        let tasks = inner.tasks.read().await;
        for dep in &task.dependencies {
            if !tasks.contains_key(dep) {
                return Err(FabricError::Validation(format!(
                    "dependency {dep} does not exist"
                )));
            }
        }
    }
    {
        let mut graph = inner.graph.write().await;
        for dep in &task.dependencies {
            if let Err(e) = graph.add_edge(*dep, id, DependencyKind::Blocks, false) {
                graph.remove_node(id);
                return Err(e);
            }
        }
    }

    {
        let graph = inner.graph.read().await;
        let ledger = inner.ledger.read().await;
        let priority = inner.priority.read().await;
        priority.rescore(&mut task, &graph, &ledger, Utc::now());
    }

    {
        let mut tasks = inner.tasks.write().await;
        for dep in task.dependencies.clone() {
            if let Some(source) = tasks.get_mut(&dep) {
                if !source.dependents.contains(&id) {
                    source.dependents.push(id);
                }
            }
        }
        tasks.insert(id, task.clone());
    }
    inner
        .handles
        .write()
        .await
        .insert(id, RuntimeHandles { routine, progress });

    persist_task(inner, &task).await;
    persist_queue(inner).await;
    if let Some(persistence) = &inner.persistence {
        let _ = persistence.record_stats(|s| s.tasks_submitted += 1).await;
    }
    inner.metrics.write().await.record_submitted();
    *inner.drained.write().await = false;
    inner.events.emit(FabricEvent::TaskQueued { task_id: id });
    debug!(task_id = %id, title = %task.title, "task submitted");

    // Offer the task to the breakdown policy; only top-level
    // submissions decompose, so policies cannot recurse unbounded.
    if parent.is_none() {
        let policy = inner.decomposer.read().await.clone();
        if let Some(policy) = policy {
            if let Some(subtasks) = policy.decompose(&task).await {
                for subtask in subtasks {
                    match Box::pin(submit_spec(inner, subtask, Some(id))).await {
                        Ok(child) => debug!(parent = %id, child = %child, "decomposed subtask"),
                        Err(e) => warn!(parent = %id, error = %e, "subtask rejected"),
                    }
                }
            }
        }
    }
    Ok(id)
}

/// One scheduler tick: readiness flips, starvation relief, two-phase
/// selection, dispatch
async fn run_tick(inner: &Arc<EngineInner>) -> FabricResult<()> {
    if *inner.paused.read().await || *inner.shutting_down.read().await {
        return Ok(());
    }
    let now = Utc::now();

    // Phase 1: readiness flips and retry-backoff expiry.
    let mut to_persist: Vec<Task> = Vec::new();
    let mut blocked_events: Vec<(TaskId, Vec<TaskId>)> = Vec::new();
    {
        let mut tasks = inner.tasks.write().await;
        let graph = inner.graph.read().await;

        let ids: Vec<TaskId> = tasks.keys().copied().collect();
        for id in ids {
            let (status, retry_due) = {
                let task = &tasks[&id];
                (
                    task.status,
                    task.next_attempt_at.map(|at| at <= now).unwrap_or(true),
                )
            };
            match status {
                TaskStatus::PendingRetry if retry_due => {
                    if graph.is_ready(id, &tasks) {
                        let task = tasks.get_mut(&id).expect("present");
                        task.status = TaskStatus::Queued;
                        task.next_attempt_at = None;
                        task.updated_at = now;
                        to_persist.push(task.clone());
                    }
                }
                TaskStatus::Pending | TaskStatus::Blocked => {
                    let deps_ready = graph.is_ready(id, &tasks);
                    let cond_ok =
                        conditions_pass(&tasks[&id].pre_conditions, &tasks[&id].metadata).is_ok();
                    if deps_ready && cond_ok {
                        let task = tasks.get_mut(&id).expect("present");
                        task.status = TaskStatus::Queued;
                        if task.scheduled_at.is_none() {
                            task.scheduled_at = Some(now);
                        }
                        task.updated_at = now;
                        to_persist.push(task.clone());
                    } else if status == TaskStatus::Pending && deps_ready && !cond_ok {
                        // Dependencies are satisfied but a guard is not;
                        // surface the block, recheck next tick.
                        let task = tasks.get_mut(&id).expect("present");
                        task.status = TaskStatus::Blocked;
                        task.updated_at = now;
                        to_persist.push(task.clone());
                        blocked_events.push((id, Vec::new()));
                    }
                }
                TaskStatus::Queued => {
                    if !graph.is_ready(id, &tasks) {
                        let blockers = graph.blockers(id, &tasks);
                        let task = tasks.get_mut(&id).expect("present");
                        task.status = TaskStatus::Blocked;
                        task.updated_at = now;
                        to_persist.push(task.clone());
                        blocked_events.push((id, blockers));
                    } else if let Err(failed) =
                        conditions_pass(&tasks[&id].pre_conditions, &tasks[&id].metadata)
                    {
                        let task = tasks.get_mut(&id).expect("present");
                        task.status = TaskStatus::Blocked;
                        task.updated_at = now;
                        to_persist.push(task.clone());
                        debug!(task_id = %id, condition = %failed, "pre-condition holds task back");
                        blocked_events.push((id, Vec::new()));
                    }
                }
                _ => {}
            }
        }
    }
    for task in &to_persist {
        persist_task(inner, task).await;
    }
    for (task_id, blockers) in blocked_events {
        inner
            .events
            .emit(FabricEvent::DependencyBlocked { task_id, blockers });
    }

    // Phase 2: one-shot starvation relief.
    apply_starvation_relief(inner, now).await;

    // Phase 3: two-phase candidate selection under the worker budget.
    let running = inner.executor.running_count().await;
    let slots = inner.config.max_concurrent_tasks.saturating_sub(running);

    let fairness = inner.scheduler.read().await.fairness_index();
    inner.metrics.write().await.set_fairness(fairness);
    debug!(fairness, running, slots, "tick");

    if slots == 0 {
        return Ok(());
    }

    // Tasks restored by crash recovery are not dispatchable until their
    // routine is registered again; they wait in the queue.
    let mut candidates: Vec<Task> = {
        let tasks = inner.tasks.read().await;
        let handles = inner.handles.read().await;
        tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued)
            .filter(|t| {
                let runnable = handles.contains_key(&t.id);
                if !runnable {
                    debug!(task_id = %t.id, "queued task has no routine registered yet");
                }
                runnable
            })
            .cloned()
            .collect()
    };
    candidates.sort_by(scheduler::tie_break);

    if candidates.is_empty() {
        maybe_emit_drained(inner, running).await;
        return Ok(());
    }

    // Tentative reservations in priority order; anything not dispatched
    // this tick is released before the tick ends.
    let mut reserved: Vec<Task> = Vec::new();
    let mut constraint_events: Vec<(TaskId, FabricError)> = Vec::new();
    {
        let mut ledger = inner.ledger.write().await;
        for task in candidates {
            match ledger.try_reserve(task.id, &task.resource_constraints) {
                Ok(()) => reserved.push(task),
                Err(e) => constraint_events.push((task.id, e)),
            }
        }
    }
    for (task_id, err) in constraint_events {
        if let FabricError::ResourceUnavailable {
            pool,
            needed,
            available,
        } = err
        {
            inner.events.emit(FabricEvent::ResourceConstraint {
                task_id,
                pool,
                needed,
                available,
            });
        }
    }

    let picks = {
        let capacities = inner.ledger.read().await.capacities();
        let ctx = SelectionContext {
            slots,
            load: running as f64 / inner.config.max_concurrent_tasks as f64,
            capacities,
            now,
        };
        inner.scheduler.write().await.select(&reserved, &ctx)
    };

    // Roll back reservations for candidates that were not selected.
    {
        let mut ledger = inner.ledger.write().await;
        for task in &reserved {
            if !picks.contains(&task.id) {
                ledger.release(task.id);
            }
        }
    }

    for id in picks {
        // Earlier dispatches in this tick change who is running; a pick
        // whose conflict partner just started must wait for a later tick.
        let still_ready = {
            let tasks = inner.tasks.read().await;
            let graph = inner.graph.read().await;
            graph.is_ready(id, &tasks)
        };
        if !still_ready {
            inner.ledger.write().await.release(id);
            continue;
        }
        dispatch_one(inner, id, now).await;
    }
    Ok(())
}

/// Move one selected task into execution
async fn dispatch_one(inner: &Arc<EngineInner>, id: TaskId, now: chrono::DateTime<Utc>) {
    let routine = {
        let handles = inner.handles.read().await;
        handles
            .get(&id)
            .map(|h| (Arc::clone(&h.routine), h.progress.clone()))
    };
    let Some((routine, progress)) = routine else {
        // Candidates are filtered on registered routines, so this only
        // races a concurrent deregistration; the task just waits.
        warn!(task_id = %id, "routine disappeared before dispatch; requeueing");
        inner.ledger.write().await.release(id);
        return;
    };

    let task_copy = {
        let mut tasks = inner.tasks.write().await;
        let Some(task) = tasks.get_mut(&id) else {
            inner.ledger.write().await.release(id);
            return;
        };
        task.status = TaskStatus::Running;
        if task.started_at.is_none() {
            task.started_at = Some(now);
            task.metrics.started_at = Some(now);
            task.metrics.wait_ms = Some((now - task.created_at).num_milliseconds().max(0) as u64);
        }
        task.updated_at = now;
        task.clone()
    };
    persist_task(inner, &task_copy).await;

    let timeout = task_copy.effective_timeout(inner.config.default_timeout_ms);
    match inner
        .executor
        .dispatch(task_copy, routine, progress, timeout, &inner.cancel_root)
        .await
    {
        Ok(()) => {
            inner.events.emit(FabricEvent::TaskStarted { task_id: id });
        }
        Err(e) => {
            warn!(task_id = %id, error = %e, "dispatch rejected; requeueing");
            {
                let mut tasks = inner.tasks.write().await;
                if let Some(task) = tasks.get_mut(&id) {
                    task.status = TaskStatus::Queued;
                }
            }
            inner.ledger.write().await.release(id);
        }
    }
}

/// Boost long-starved queued tasks once, to the strongest running tier
async fn apply_starvation_relief(inner: &Arc<EngineInner>, now: chrono::DateTime<Utc>) {
    let max_wait = chrono::Duration::seconds(inner.config.max_starvation_time_secs as i64);
    let mut to_persist = Vec::new();
    {
        let mut tasks = inner.tasks.write().await;
        let mut priority = inner.priority.write().await;

        let floor = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .map(|t| t.base_priority)
            .max()
            .or_else(|| {
                tasks
                    .values()
                    .filter(|t| t.status == TaskStatus::Queued)
                    .map(|t| t.base_priority)
                    .max()
            });
        let Some(floor) = floor else {
            return;
        };

        let starved: Vec<TaskId> = tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Queued
                    && now - t.scheduled_at.unwrap_or(t.created_at) > max_wait
                    && !priority.is_boosted(t.id)
            })
            .map(|t| t.id)
            .collect();
        for id in starved {
            if let Some(task) = tasks.get_mut(&id) {
                if priority.starvation_boost(task, floor) {
                    task.updated_at = now;
                    to_persist.push(task.clone());
                }
            }
        }
    }
    for task in &to_persist {
        persist_task(inner, task).await;
    }
}

/// Apply one execution outcome to the task table
async fn handle_completion(inner: &Arc<EngineInner>, completion: Completion) {
    let id = completion.task_id;
    let current = {
        let tasks = inner.tasks.read().await;
        tasks.get(&id).map(|t| t.status)
    };
    // A grace-abandoned attempt can still race its own late completion.
    if current != Some(TaskStatus::Running) {
        debug!(task_id = %id, "stale completion ignored");
        return;
    }

    match completion.outcome {
        TaskOutcome::Success(output) => {
            // Post-condition guards run against the task's context.
            let violated = {
                let tasks = inner.tasks.read().await;
                tasks.get(&id).and_then(|t| {
                    conditions_pass(&t.post_conditions, &t.metadata)
                        .err()
                        .map(|expr| format!("post-condition failed: {expr}"))
                })
            };
            if let Some(message) = violated {
                let err = FabricError::Execution {
                    message,
                    retryable: true,
                };
                handle_failure(inner, id, err, completion.duration_ms).await;
                return;
            }
            handle_success(inner, id, output, completion.duration_ms).await;
        }
        TaskOutcome::Failure(err) => {
            handle_failure(inner, id, err, completion.duration_ms).await;
        }
        TaskOutcome::TimedOut(limit) => {
            handle_failure(inner, id, FabricError::Timeout(limit), completion.duration_ms).await;
        }
        TaskOutcome::Cancelled { leaked } => {
            if leaked {
                let mut tasks = inner.tasks.write().await;
                if let Some(task) = tasks.get_mut(&id) {
                    task.metadata.insert("leaked_work".into(), "true".into());
                }
            }
            finalize_cancelled(inner, id, Some("cancellation requested".into()), false).await;
        }
    }
}

async fn handle_success(
    inner: &Arc<EngineInner>,
    id: TaskId,
    output: ExecutionOutput,
    duration_ms: u64,
) {
    let now = Utc::now();
    let task_copy = {
        let mut tasks = inner.tasks.write().await;
        let Some(task) = tasks.get_mut(&id) else {
            return;
        };
        task.status = TaskStatus::Completed;
        task.completed_at = Some(now);
        task.actual_duration_ms = Some(duration_ms);
        task.metrics.finished_at = Some(now);
        task.metrics.duration_ms = Some(duration_ms);
        task.metrics.cpu_seconds = output.cpu_seconds.or(task.metrics.cpu_seconds);
        task.metrics.memory_peak_mb = output.memory_peak_mb.or(task.metrics.memory_peak_mb);
        task.metrics.result_size_bytes =
            output.result.as_ref().map(|v| v.to_string().len() as u64);
        task.updated_at = now;
        task.clone()
    };

    inner.ledger.write().await.release(id);

    // Soft-edge boosts for dependents, then bookkeeping.
    let boosted: Vec<TaskId> = {
        let graph = inner.graph.read().await;
        let mut priority = inner.priority.write().await;
        let dependents = graph.soft_dependents(id);
        for (dependent, kind) in &dependents {
            priority.apply_soft_boost(*dependent, *kind);
        }
        priority.record_outcome(task_copy.category, true, duration_ms);
        priority.forget(id);
        dependents.into_iter().map(|(dep, _)| dep).collect()
    };
    if !boosted.is_empty() {
        // Re-score the boosted dependents right away instead of waiting
        // for the next adjustment interval.
        let now = Utc::now();
        let mut tasks = inner.tasks.write().await;
        let graph = inner.graph.read().await;
        let ledger = inner.ledger.read().await;
        let priority = inner.priority.read().await;
        for dep in boosted {
            if let Some(task) = tasks.get_mut(&dep) {
                if !task.status.is_terminal() {
                    priority.rescore(task, &graph, &ledger, now);
                }
            }
        }
    }
    inner
        .scheduler
        .write()
        .await
        .record_completion(task_copy.base_priority);
    inner.metrics.write().await.record_completed(
        task_copy.base_priority,
        task_copy.category,
        task_copy.metrics.wait_ms.unwrap_or(0),
        duration_ms,
    );
    inner.handles.write().await.remove(&id);

    persist_task(inner, &task_copy).await;
    if let Some(persistence) = &inner.persistence {
        let _ = persistence.record_stats(|s| s.tasks_completed += 1).await;
    }
    inner.events.emit(FabricEvent::TaskCompleted {
        task_id: id,
        duration_ms,
    });
    info!(task_id = %id, duration_ms, "task completed");

    // Subtasks emitted by the routine are submitted under this task.
    for spec in output.next_tasks {
        match submit_spec(inner, spec, Some(id)).await {
            Ok(child) => debug!(parent = %id, child = %child, "subtask submitted"),
            Err(e) => warn!(parent = %id, error = %e, "subtask rejected"),
        }
    }

    maybe_emit_drained(inner, inner.executor.running_count().await).await;
}

async fn handle_failure(inner: &Arc<EngineInner>, id: TaskId, err: FabricError, duration_ms: u64) {
    let now = Utc::now();
    let retryable = err.is_retryable();
    let kind = err.kind();
    let message = err.to_string();

    enum Disposition {
        Retry(Task),
        Fail(Task),
    }

    let disposition = {
        let mut tasks = inner.tasks.write().await;
        let Some(task) = tasks.get_mut(&id) else {
            return;
        };
        task.last_error = Some(message.clone());
        task.metrics.duration_ms = Some(duration_ms);
        task.updated_at = now;
        if retryable && task.current_retries < task.max_retries {
            task.current_retries += 1;
            task.metrics.retry_count = task.current_retries;
            task.retry_history.push(RetryAttempt {
                attempt: task.current_retries,
                at: now,
                error_kind: kind,
                message: message.clone(),
            });
            task.status = TaskStatus::PendingRetry;
            let backoff = retry_backoff(task.current_retries);
            task.next_attempt_at =
                Some(now + chrono::Duration::milliseconds(backoff.as_millis() as i64));
            Disposition::Retry(task.clone())
        } else {
            task.retry_history.push(RetryAttempt {
                attempt: task.current_retries + 1,
                at: now,
                error_kind: kind,
                message: message.clone(),
            });
            task.status = TaskStatus::Failed;
            task.completed_at = Some(now);
            task.metrics.finished_at = Some(now);
            Disposition::Fail(task.clone())
        }
    };

    // Resources are released regardless of disposition.
    inner.ledger.write().await.release(id);

    match disposition {
        Disposition::Retry(task) => {
            warn!(
                task_id = %id,
                attempt = task.current_retries,
                next_attempt = ?task.next_attempt_at,
                error = %message,
                "task failed; retry scheduled"
            );
            persist_task(inner, &task).await;
        }
        Disposition::Fail(task) => {
            {
                let mut priority = inner.priority.write().await;
                priority.record_outcome(task.category, false, duration_ms);
                priority.forget(id);
            }
            inner.metrics.write().await.record_failed();

            // Compensation hook, bounded like an execution attempt.
            if let Some(outcome) = run_rollback(inner, &task).await {
                let mut tasks = inner.tasks.write().await;
                if let Some(t) = tasks.get_mut(&id) {
                    t.metadata.insert("rollback".into(), outcome);
                }
            }

            inner.handles.write().await.remove(&id);
            let task = inner.tasks.read().await.get(&id).cloned().unwrap_or(task);
            persist_task(inner, &task).await;
            if let Some(persistence) = &inner.persistence {
                let _ = persistence.record_stats(|s| s.tasks_failed += 1).await;
            }
            error!(task_id = %id, error = %message, "task failed terminally");
            inner.events.emit(FabricEvent::TaskFailed {
                task_id: id,
                error_kind: kind,
                message,
            });
            maybe_emit_drained(inner, inner.executor.running_count().await).await;
        }
    }
}

/// Run the routine's rollback hook with the default timeout; returns a
/// human-readable outcome for the task record
async fn run_rollback(inner: &Arc<EngineInner>, task: &Task) -> Option<String> {
    let routine = {
        let handles = inner.handles.read().await;
        handles.get(&task.id).map(|h| Arc::clone(&h.routine))
    }?;
    let ctx = ExecutionContext::new(
        task.id,
        task.current_retries + 1,
        inner.cancel_root.child_token(),
        task.metadata.clone(),
        None,
    );
    let limit = Duration::from_millis(inner.config.default_timeout_ms);
    match tokio::time::timeout(limit, routine.rollback(task, &ctx)).await {
        Ok(Ok(())) => Some("ok".to_string()),
        Ok(Err(e)) => {
            warn!(task_id = %task.id, error = %e, "rollback failed");
            Some(format!("failed: {e}"))
        }
        Err(_) => {
            warn!(task_id = %task.id, "rollback timed out");
            Some("timed out".to_string())
        }
    }
}

/// Mark a task cancelled, release its resources, emit the failure event
async fn finalize_cancelled(
    inner: &Arc<EngineInner>,
    id: TaskId,
    reason: Option<String>,
    shutdown_abandoned: bool,
) {
    let now = Utc::now();
    let task_copy = {
        let mut tasks = inner.tasks.write().await;
        let Some(task) = tasks.get_mut(&id) else {
            return;
        };
        if task.status.is_terminal() {
            return;
        }
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(now);
        task.last_error = reason.clone();
        if shutdown_abandoned {
            task.metadata
                .insert("shutdown_abandoned".into(), "true".into());
        }
        task.updated_at = now;
        task.clone()
    };

    inner.ledger.write().await.release(id);
    {
        let mut priority = inner.priority.write().await;
        priority.forget(id);
    }
    inner.metrics.write().await.record_cancelled();
    inner.handles.write().await.remove(&id);
    persist_task(inner, &task_copy).await;
    inner.events.emit(FabricEvent::TaskFailed {
        task_id: id,
        error_kind: ErrorKind::Cancelled,
        message: reason.unwrap_or_else(|| "cancelled".to_string()),
    });
    info!(task_id = %id, shutdown_abandoned, "task cancelled");
}

/// Recompute dynamic scores for every live task
async fn readjust_priorities(inner: &Arc<EngineInner>) {
    let now = Utc::now();
    let mut tasks = inner.tasks.write().await;
    let graph = inner.graph.read().await;
    let ledger = inner.ledger.read().await;
    let priority = inner.priority.read().await;
    for task in tasks.values_mut() {
        if !task.status.is_terminal() {
            priority.rescore(task, &graph, &ledger, now);
        }
    }
    debug!("dynamic priorities readjusted");
}

/// Remove terminal tasks that completed before `cutoff` from memory,
/// the graph, and the store
async fn cleanup_terminal(
    inner: &Arc<EngineInner>,
    cutoff: chrono::DateTime<Utc>,
) -> FabricResult<Vec<TaskId>> {
    let removed: Vec<TaskId> = {
        let tasks = inner.tasks.read().await;
        tasks
            .values()
            .filter(|t| {
                t.status.is_terminal() && t.completed_at.map(|at| at < cutoff).unwrap_or(false)
            })
            .map(|t| t.id)
            .collect()
    };
    {
        let mut tasks = inner.tasks.write().await;
        let mut graph = inner.graph.write().await;
        for id in &removed {
            tasks.remove(id);
            graph.remove_node(*id);
        }
    }
    if let Some(persistence) = &inner.persistence {
        persistence.cleanup(cutoff).await?;
    }
    Ok(removed)
}

/// Emit queue-drained exactly once per idle period
async fn maybe_emit_drained(inner: &Arc<EngineInner>, running: usize) {
    if running > 0 {
        return;
    }
    let idle = {
        let tasks = inner.tasks.read().await;
        tasks.values().all(|t| t.status.is_terminal())
    };
    if !idle {
        return;
    }
    let mut drained = inner.drained.write().await;
    if !*drained {
        *drained = true;
        inner.events.emit(FabricEvent::QueueDrained);
        info!("queue drained");
    }
}

async fn persist_task(inner: &Arc<EngineInner>, task: &Task) {
    if let Some(persistence) = &inner.persistence {
        if let Err(e) = persistence.store().save(task, None).await {
            warn!(task_id = %task.id, error = %e, "task persist failed");
        }
    }
}

/// Persist the scheduling queue record (ordering + typed edges)
async fn persist_queue(inner: &Arc<EngineInner>) {
    let Some(persistence) = &inner.persistence else {
        return;
    };
    let queue = build_queue_state(inner).await;
    if let Err(e) = persistence.save_queue(&queue).await {
        warn!(error = %e, "queue persist failed");
    }
}

async fn build_queue_state(inner: &Arc<EngineInner>) -> QueueState {
    let mut queued: Vec<Task> = {
        let tasks = inner.tasks.read().await;
        tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .cloned()
            .collect()
    };
    queued.sort_by(scheduler::tie_break);
    let edges = inner.graph.read().await.edges();
    QueueState {
        id: "main".to_string(),
        task_ids: queued.into_iter().map(|t| t.id).collect(),
        edges,
        updated_at: Some(Utc::now()),
    }
}

/// Snapshot state and write a checkpoint of the given kind
async fn write_checkpoint(
    inner: &Arc<EngineInner>,
    kind: CheckpointKind,
) -> FabricResult<Option<Checkpoint>> {
    let Some(persistence) = &inner.persistence else {
        return Ok(None);
    };
    let tasks_snapshot = inner.tasks.read().await.clone();
    let queue = build_queue_state(inner).await;
    let checkpoint = persistence
        .create_checkpoint(&tasks_snapshot, &queue, kind)
        .await?;
    inner.events.emit(FabricEvent::CheckpointCreated {
        checkpoint_id: checkpoint.id,
        kind,
    });
    Ok(Some(checkpoint))
}
