//! Cross-session persistence engine
//!
//! Owns a [`FileTaskStore`] (composition, not inheritance) and layers
//! session tracking, checkpointing, and crash recovery on top of it.
//!
//! ## Session boot
//!
//! At construction the engine writes its own session record; recovery
//! then scans for other sessions whose `last_activity` is older than the
//! session timeout, marks them crashed, and — when crash recovery is
//! enabled — restores their latest checkpoint. Any task that was running
//! at checkpoint time comes back as a pending retry with its retry count
//! bumped, making the at-least-once contract observable to callers.
//!
//! Write-through task records may be fresher than the checkpoint, so
//! restored state is reconciled record-by-record under the configured
//! conflict-resolution policy.
//!
//! Heartbeat and checkpoint timers are owned by the engine facade, not
//! by this type; everything here is a passive operation.

use crate::config::{ConflictResolution, PersistenceConfig};
use crate::store::{content_hash, FileTaskStore, RecordKind};
use crate::types::{
    DependencyEdge, ErrorKind, FabricError, FabricResult, RetryAttempt, Task, TaskId, TaskStatus,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Origin of a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    /// Written by the periodic timer; subject to retention eviction
    Automatic,
    /// Requested explicitly; never auto-evicted
    Manual,
    /// Written while restoring a crashed session
    CrashRecovery,
}

/// Lifecycle state of a session record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Inactive,
    Crashed,
    Terminated,
}

/// Host process details recorded with a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub hostname: String,
}

impl ProcessInfo {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
        }
    }
}

/// Counters accumulated over a session's lifetime
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SessionStatistics {
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub checkpoints_created: u64,
}

/// One engine lifetime within a process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub state: SessionState,
    pub process_info: ProcessInfo,
    pub statistics: SessionStatistics,
}

/// Persisted scheduling-queue state, including the typed dependency
/// edges needed to rebuild the graph after a restart
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueState {
    pub id: String,
    pub task_ids: Vec<TaskId>,
    pub edges: Vec<DependencyEdge>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Immutable snapshot of tasks and queues used for recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub session_id: Uuid,
    pub task_snapshot: HashMap<TaskId, Task>,
    pub queue_snapshot: HashMap<String, QueueState>,
    pub active_transactions: Vec<Uuid>,
    pub kind: CheckpointKind,
    /// SHA-256 over the canonically ordered snapshot entries
    pub integrity_hash: String,
    /// Serialized size of the snapshot, in bytes
    pub size: u64,
}

impl Checkpoint {
    fn snapshot_hash(
        tasks: &HashMap<TaskId, Task>,
        queues: &HashMap<String, QueueState>,
    ) -> FabricResult<String> {
        let value = serde_json::json!({
            "tasks": tasks,
            "queues": queues,
        });
        Ok(content_hash(&value))
    }
}

/// What boot recovery found and restored
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub crashed_sessions: Vec<Uuid>,
    /// Reconciled task table to install in memory
    pub tasks: HashMap<TaskId, Task>,
    /// Dependency edges to rebuild the graph from
    pub edges: Vec<DependencyEdge>,
    /// Tasks that were running at crash time, now pending retry
    pub recovered_running: usize,
    /// Tasks the `manual` policy kept both versions of
    pub conflicts: Vec<TaskId>,
}

/// Session and checkpoint management over the task store
pub struct PersistenceEngine {
    store: FileTaskStore,
    config: PersistenceConfig,
    session: RwLock<SessionMetadata>,
}

impl PersistenceEngine {
    /// Open the store, take the advisory lock, and register this session
    pub async fn new(config: PersistenceConfig) -> FabricResult<Self> {
        let store = FileTaskStore::open(
            config.root.clone(),
            config.compression,
            config.performance.clone(),
        )
        .await?;

        let now = Utc::now();
        let session = SessionMetadata {
            session_id: Uuid::new_v4(),
            start_time: now,
            end_time: None,
            last_activity: now,
            state: SessionState::Active,
            process_info: ProcessInfo::current(),
            statistics: SessionStatistics::default(),
        };

        let engine = Self {
            store,
            config,
            session: RwLock::new(session),
        };
        engine.save_session().await?;

        if engine.config.performance.prefetch_enabled {
            let warmed = engine.store.prefetch().await.unwrap_or(0);
            info!(warmed, "read cache prefetched");
        }
        Ok(engine)
    }

    pub fn store(&self) -> &FileTaskStore {
        &self.store
    }

    pub async fn session_id(&self) -> Uuid {
        self.session.read().await.session_id
    }

    async fn save_session(&self) -> FabricResult<()> {
        let session = self.session.read().await.clone();
        let payload = serde_json::to_value(&session)?;
        self.store
            .write_record(RecordKind::Session, &session.session_id.to_string(), payload)
            .await
    }

    /// Rewrite this session's `last_activity`
    pub async fn heartbeat(&self) -> FabricResult<()> {
        self.session.write().await.last_activity = Utc::now();
        self.save_session().await
    }

    /// Update session statistics and persist the record
    pub async fn record_stats<F>(&self, update: F) -> FabricResult<()>
    where
        F: FnOnce(&mut SessionStatistics),
    {
        {
            let mut session = self.session.write().await;
            update(&mut session.statistics);
            session.last_activity = Utc::now();
        }
        self.save_session().await
    }

    /// Detect crashed sessions and restore their state.
    ///
    /// Always marks stale sessions as crashed; restores state only when
    /// crash recovery is enabled in the configuration.
    pub async fn boot_recovery(&self) -> FabricResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let own_id = self.session_id().await;
        let timeout = Duration::seconds(self.config.session_timeout_secs as i64);
        let now = Utc::now();

        for id in self.store.list_ids(RecordKind::Session).await? {
            let payload = match self.store.read_record(RecordKind::Session, &id).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(session = id, error = %e, "unreadable session record skipped");
                    continue;
                }
            };
            let mut session: SessionMetadata = serde_json::from_value(payload)?;
            if session.session_id == own_id {
                continue;
            }
            if session.state == SessionState::Active && now - session.last_activity > timeout {
                info!(session = %session.session_id, "stale session marked crashed");
                session.state = SessionState::Crashed;
                session.end_time = Some(now);
                let payload = serde_json::to_value(&session)?;
                self.store
                    .write_record(RecordKind::Session, &id, payload)
                    .await?;
                report.crashed_sessions.push(session.session_id);
            }
        }

        if !self.config.crash_recovery_enabled || report.crashed_sessions.is_empty() {
            return Ok(report);
        }

        // Restore each crashed session's latest checkpoint, newest last
        // so fresher snapshots win ties.
        let mut checkpoints: Vec<Checkpoint> = Vec::new();
        for session_id in &report.crashed_sessions {
            if let Some(cp) = self.latest_checkpoint_for(*session_id).await? {
                checkpoints.push(cp);
            }
        }
        checkpoints.sort_by_key(|cp| cp.timestamp);

        for cp in checkpoints {
            for (id, task) in cp.task_snapshot {
                report.tasks.insert(id, task);
            }
            for queue in cp.queue_snapshot.into_values() {
                report.edges.extend(queue.edges);
            }
        }

        // Write-through task records may be newer than any checkpoint;
        // reconcile under the configured policy. A record that fails its
        // integrity check is skipped so the checkpoint copy survives.
        for id in self.store.list_ids(RecordKind::Task).await? {
            let record = match self.store.load(&id, false).await {
                Ok(task) => task,
                Err(e @ FabricError::Integrity { .. }) => {
                    warn!(task = id, error = %e, "corrupt task record, keeping checkpoint copy");
                    continue;
                }
                Err(e) => return Err(e),
            };
            match report.tasks.remove(&record.id) {
                None => {
                    report.tasks.insert(record.id, record);
                }
                Some(restored) => {
                    let (winner, conflicted) = self.resolve_conflict(restored, record);
                    if conflicted {
                        report.conflicts.push(winner.id);
                    }
                    report.tasks.insert(winner.id, winner);
                }
            }
        }

        // At-least-once: anything mid-flight at crash time retries.
        for task in report.tasks.values_mut() {
            if task.status == TaskStatus::Running || task.status == TaskStatus::Queued {
                if task.status == TaskStatus::Running {
                    task.current_retries += 1;
                    task.metrics.retry_count = task.current_retries;
                    task.retry_history.push(RetryAttempt {
                        attempt: task.current_retries,
                        at: now,
                        error_kind: ErrorKind::Execution,
                        message: "session crashed mid-execution".to_string(),
                    });
                    report.recovered_running += 1;
                }
                task.status = if task.status == TaskStatus::Running {
                    TaskStatus::PendingRetry
                } else {
                    TaskStatus::Queued
                };
                task.next_attempt_at = None;
                task.updated_at = now;
                self.store.save(task, None).await?;
            }
        }
        report.edges.sort_by_key(|e| (e.from, e.to));
        report.edges.dedup();

        info!(
            crashed = report.crashed_sessions.len(),
            restored = report.tasks.len(),
            rerun = report.recovered_running,
            "crash recovery complete"
        );
        Ok(report)
    }

    /// Capture a consistent snapshot under a store transaction
    pub async fn create_checkpoint(
        &self,
        tasks: &HashMap<TaskId, Task>,
        queue: &QueueState,
        kind: CheckpointKind,
    ) -> FabricResult<Checkpoint> {
        let mut queues = HashMap::new();
        queues.insert(queue.id.clone(), queue.clone());

        let integrity_hash = Checkpoint::snapshot_hash(tasks, &queues)?;
        let session_id = self.session_id().await;
        let checkpoint = Checkpoint {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            session_id,
            task_snapshot: tasks.clone(),
            queue_snapshot: queues,
            active_transactions: self.store.active_transactions().await,
            kind,
            integrity_hash,
            size: 0,
        };
        let mut payload = serde_json::to_value(&checkpoint)?;
        let size = payload.to_string().len() as u64;
        payload["size"] = serde_json::json!(size);

        let tx = self.store.begin().await;
        self.store
            .stage(tx, RecordKind::Checkpoint, checkpoint.id.to_string(), payload)
            .await?;
        self.store.commit(tx).await?;

        self.enforce_retention().await?;
        self.record_stats(|s| s.checkpoints_created += 1).await?;
        info!(checkpoint = %checkpoint.id, ?kind, size, "checkpoint created");
        Ok(Checkpoint { size, ..checkpoint })
    }

    /// Load and validate a checkpoint by id
    pub async fn load_checkpoint(&self, id: Uuid) -> FabricResult<Checkpoint> {
        let payload = self
            .store
            .read_record(RecordKind::Checkpoint, &id.to_string())
            .await?;
        let checkpoint: Checkpoint = serde_json::from_value(payload)?;
        let actual =
            Checkpoint::snapshot_hash(&checkpoint.task_snapshot, &checkpoint.queue_snapshot)?;
        if actual != checkpoint.integrity_hash {
            return Err(FabricError::Integrity {
                record: format!("checkpoints/{id}"),
                expected: checkpoint.integrity_hash,
                actual,
            });
        }
        Ok(checkpoint)
    }

    /// All checkpoints, oldest first
    pub async fn list_checkpoints(&self) -> FabricResult<Vec<Checkpoint>> {
        let mut checkpoints = Vec::new();
        for id in self.store.list_ids(RecordKind::Checkpoint).await? {
            match self
                .store
                .read_record(RecordKind::Checkpoint, &id)
                .await
                .and_then(|p| Ok(serde_json::from_value::<Checkpoint>(p)?))
            {
                Ok(cp) => checkpoints.push(cp),
                Err(e) => warn!(checkpoint = id, error = %e, "unreadable checkpoint skipped"),
            }
        }
        checkpoints.sort_by_key(|cp| cp.timestamp);
        Ok(checkpoints)
    }

    async fn latest_checkpoint_for(&self, session_id: Uuid) -> FabricResult<Option<Checkpoint>> {
        let mut latest: Option<Checkpoint> = None;
        for cp in self.list_checkpoints().await? {
            if cp.session_id != session_id {
                continue;
            }
            match self.load_checkpoint(cp.id).await {
                Ok(valid) => latest = Some(valid),
                Err(FabricError::Integrity { .. }) => {
                    warn!(checkpoint = %cp.id, "corrupt checkpoint skipped, falling back to an earlier one");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(latest)
    }

    /// FIFO-evict automatic checkpoints beyond the retention bound
    async fn enforce_retention(&self) -> FabricResult<()> {
        let automatic: Vec<Checkpoint> = self
            .list_checkpoints()
            .await?
            .into_iter()
            .filter(|cp| cp.kind == CheckpointKind::Automatic)
            .collect();
        if automatic.len() <= self.config.max_checkpoints {
            return Ok(());
        }
        let excess = automatic.len() - self.config.max_checkpoints;
        for cp in automatic.into_iter().take(excess) {
            self.store
                .delete_record(RecordKind::Checkpoint, &cp.id.to_string())
                .await?;
            info!(checkpoint = %cp.id, "retention evicted checkpoint");
        }
        Ok(())
    }

    /// Persist the scheduling queue record
    pub async fn save_queue(&self, queue: &QueueState) -> FabricResult<()> {
        let payload = serde_json::to_value(queue)?;
        self.store
            .write_record(RecordKind::Queue, &queue.id, payload)
            .await
    }

    /// Resolve a concurrent-session conflict between two versions of a
    /// task. Returns the winner and whether the caller should surface a
    /// conflict event.
    pub fn resolve_conflict(&self, local: Task, remote: Task) -> (Task, bool) {
        match self.config.conflict_resolution {
            ConflictResolution::Timestamp => {
                if remote.updated_at >= local.updated_at {
                    (remote, false)
                } else {
                    (local, false)
                }
            }
            ConflictResolution::Manual => (local, true),
            ConflictResolution::Merge => (Self::merge_tasks(local, remote), false),
        }
    }

    /// Field-level merge: the further status in the state machine wins,
    /// retry counts take the max, metrics prefer present-over-absent,
    /// metadata unions with the newer side winning key clashes
    fn merge_tasks(local: Task, remote: Task) -> Task {
        let (older, mut newer) = if remote.updated_at >= local.updated_at {
            (local, remote)
        } else {
            (remote, local)
        };

        if older.status.rank() > newer.status.rank() {
            newer.status = older.status;
            newer.completed_at = newer.completed_at.or(older.completed_at);
        }
        newer.current_retries = newer.current_retries.max(older.current_retries);
        if newer.retry_history.len() < older.retry_history.len() {
            newer.retry_history = older.retry_history.clone();
        }
        newer.metrics.retry_count = newer.metrics.retry_count.max(older.metrics.retry_count);
        newer.metrics.started_at = newer.metrics.started_at.or(older.metrics.started_at);
        newer.metrics.finished_at = newer.metrics.finished_at.or(older.metrics.finished_at);
        newer.metrics.wait_ms = newer.metrics.wait_ms.or(older.metrics.wait_ms);
        newer.metrics.duration_ms = newer.metrics.duration_ms.or(older.metrics.duration_ms);
        newer.metrics.cpu_seconds = newer.metrics.cpu_seconds.or(older.metrics.cpu_seconds);
        newer.metrics.memory_peak_mb =
            newer.metrics.memory_peak_mb.or(older.metrics.memory_peak_mb);
        newer.last_error = newer.last_error.or(older.last_error);
        for (key, value) in older.metadata {
            newer.metadata.entry(key).or_insert(value);
        }
        newer
    }

    /// Remove terminal tasks that completed before `cutoff`
    pub async fn cleanup(&self, cutoff: DateTime<Utc>) -> FabricResult<Vec<TaskId>> {
        let stale = self
            .store
            .enumerate(|t| {
                t.status.is_terminal()
                    && t.completed_at.map(|at| at < cutoff).unwrap_or(false)
            })
            .await?;
        let mut removed = Vec::new();
        for task in stale {
            self.store
                .delete_record(RecordKind::Task, &task.id.to_string())
                .await?;
            removed.push(task.id);
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "cleaned up terminal tasks");
        }
        Ok(removed)
    }

    /// Finish the session: flush, mark its final state, drop the lock
    pub async fn end_session(&self, state: SessionState) -> FabricResult<()> {
        self.store.flush().await?;
        {
            let mut session = self.session.write().await;
            session.state = state;
            session.end_time = Some(Utc::now());
            session.last_activity = Utc::now();
        }
        self.save_session().await?;
        self.store.release_lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PerformanceConfig;
    use crate::types::{Priority, PriorityFactors, TaskCategory, TaskMetrics};

    fn config(root: &std::path::Path) -> PersistenceConfig {
        PersistenceConfig {
            root: root.to_path_buf(),
            session_timeout_secs: 60,
            max_checkpoints: 2,
            performance: PerformanceConfig {
                prefetch_enabled: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn sample_task(status: TaskStatus) -> Task {
        Task {
            id: Uuid::new_v4(),
            title: "t".into(),
            description: "d".into(),
            category: TaskCategory::Feature,
            tags: vec![],
            base_priority: Priority::Medium,
            dynamic_priority: 500.0,
            boosted_tier: None,
            priority_factors: PriorityFactors::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            deadline: None,
            estimated_duration_ms: 1000,
            actual_duration_ms: None,
            timeout_ms: None,
            max_retries: 3,
            current_retries: 0,
            next_attempt_at: None,
            status,
            dependencies: vec![],
            dependents: vec![],
            required_resources: vec![],
            resource_constraints: Default::default(),
            pre_conditions: vec![],
            post_conditions: vec![],
            batch_compatible: false,
            batch_group: None,
            user_importance: 0.5,
            parent_task_id: None,
            last_error: None,
            retry_history: vec![],
            metrics: TaskMetrics::default(),
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_checkpoint_roundtrip_is_lossless() {
        let dir = tempfile::tempdir().unwrap();
        let engine = PersistenceEngine::new(config(dir.path())).await.unwrap();

        let mut tasks = HashMap::new();
        let t = sample_task(TaskStatus::Queued);
        tasks.insert(t.id, t.clone());
        let queue = QueueState {
            id: "main".into(),
            task_ids: vec![t.id],
            edges: vec![],
            updated_at: Some(Utc::now()),
        };

        let cp = engine
            .create_checkpoint(&tasks, &queue, CheckpointKind::Manual)
            .await
            .unwrap();
        let restored = engine.load_checkpoint(cp.id).await.unwrap();

        // byte-equality under canonical encoding
        let before = serde_json::to_value(&tasks).unwrap();
        let after = serde_json::to_value(&restored.task_snapshot).unwrap();
        assert_eq!(
            crate::store::canonical_json(&before),
            crate::store::canonical_json(&after)
        );
        assert_eq!(restored.queue_snapshot["main"].task_ids, vec![t.id]);
    }

    #[tokio::test]
    async fn test_retention_keeps_manual_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let engine = PersistenceEngine::new(config(dir.path())).await.unwrap();
        let tasks = HashMap::new();
        let queue = QueueState::default();

        let manual = engine
            .create_checkpoint(&tasks, &queue, CheckpointKind::Manual)
            .await
            .unwrap();
        for _ in 0..4 {
            engine
                .create_checkpoint(&tasks, &queue, CheckpointKind::Automatic)
                .await
                .unwrap();
        }

        let remaining = engine.list_checkpoints().await.unwrap();
        let automatic = remaining
            .iter()
            .filter(|cp| cp.kind == CheckpointKind::Automatic)
            .count();
        assert_eq!(automatic, 2);
        assert!(remaining.iter().any(|cp| cp.id == manual.id));
    }

    #[tokio::test]
    async fn test_crash_detection_and_running_requeue() {
        let dir = tempfile::tempdir().unwrap();

        // Simulate a dead session: active record with stale heartbeat
        // plus a checkpoint holding a running task.
        {
            let engine = PersistenceEngine::new(config(dir.path())).await.unwrap();
            let running = sample_task(TaskStatus::Running);
            let mut tasks = HashMap::new();
            tasks.insert(running.id, running.clone());
            engine.store().save(&running, None).await.unwrap();
            let queue = QueueState {
                id: "main".into(),
                task_ids: vec![running.id],
                edges: vec![],
                updated_at: Some(Utc::now()),
            };
            engine
                .create_checkpoint(&tasks, &queue, CheckpointKind::Automatic)
                .await
                .unwrap();

            // age the heartbeat past the timeout without ending the session
            {
                let mut session = engine.session.write().await;
                session.last_activity = Utc::now() - Duration::seconds(3600);
            }
            engine.save_session().await.unwrap();
        }

        let engine = PersistenceEngine::new(config(dir.path())).await.unwrap();
        let report = engine.boot_recovery().await.unwrap();

        assert_eq!(report.crashed_sessions.len(), 1);
        assert_eq!(report.recovered_running, 1);
        let recovered = report.tasks.values().next().unwrap();
        assert_eq!(recovered.status, TaskStatus::PendingRetry);
        assert_eq!(recovered.current_retries, 1);
        assert_eq!(recovered.retry_history.len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_policies() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());

        let mut old = sample_task(TaskStatus::Running);
        old.updated_at = Utc::now() - Duration::seconds(60);
        old.current_retries = 2;
        old.metadata.insert("origin".into(), "old".into());
        let mut new = old.clone();
        new.updated_at = Utc::now();
        new.status = TaskStatus::Queued;
        new.current_retries = 1;
        new.metadata.insert("fresh".into(), "yes".into());

        // timestamp: newer wins wholesale
        cfg.conflict_resolution = ConflictResolution::Timestamp;
        let engine = PersistenceEngine::new(cfg.clone()).await.unwrap();
        let (winner, conflicted) = engine.resolve_conflict(old.clone(), new.clone());
        assert_eq!(winner.status, TaskStatus::Queued);
        assert!(!conflicted);

        // manual: local kept, conflict surfaced
        cfg.conflict_resolution = ConflictResolution::Manual;
        let engine = PersistenceEngine::new(cfg.clone()).await.unwrap();
        let (winner, conflicted) = engine.resolve_conflict(old.clone(), new.clone());
        assert_eq!(winner.status, TaskStatus::Running);
        assert!(conflicted);

        // merge: further status wins, retries max, metadata unions
        cfg.conflict_resolution = ConflictResolution::Merge;
        let engine = PersistenceEngine::new(cfg).await.unwrap();
        let (winner, conflicted) = engine.resolve_conflict(old, new);
        assert!(!conflicted);
        assert_eq!(winner.status, TaskStatus::Running);
        assert_eq!(winner.current_retries, 2);
        assert_eq!(winner.metadata.get("origin").map(String::as_str), Some("old"));
        assert_eq!(winner.metadata.get("fresh").map(String::as_str), Some("yes"));
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_old_terminal_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let engine = PersistenceEngine::new(config(dir.path())).await.unwrap();

        let mut old_done = sample_task(TaskStatus::Completed);
        old_done.completed_at = Some(Utc::now() - Duration::days(10));
        let mut fresh_done = sample_task(TaskStatus::Completed);
        fresh_done.completed_at = Some(Utc::now());
        let running = sample_task(TaskStatus::Running);

        for t in [&old_done, &fresh_done, &running] {
            engine.store().save(t, None).await.unwrap();
        }

        let removed = engine
            .cleanup(Utc::now() - Duration::days(1))
            .await
            .unwrap();
        assert_eq!(removed, vec![old_done.id]);
        assert!(engine
            .store()
            .load(&fresh_done.id.to_string(), false)
            .await
            .is_ok());
        assert!(engine
            .store()
            .load(&running.id.to_string(), false)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_end_session_terminates_and_unlocks() {
        let dir = tempfile::tempdir().unwrap();
        let engine = PersistenceEngine::new(config(dir.path())).await.unwrap();
        let id = engine.session_id().await;
        engine.end_session(SessionState::Terminated).await.unwrap();

        assert!(!dir.path().join(".lock").exists());
        let payload = engine
            .store()
            .read_record(RecordKind::Session, &id.to_string())
            .await
            .unwrap();
        let session: SessionMetadata = serde_json::from_value(payload).unwrap();
        assert_eq!(session.state, SessionState::Terminated);
        assert!(session.end_time.is_some());
    }
}
