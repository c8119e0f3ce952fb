//! Shared helpers for the integration suites

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskfabric::{
    routine_fn, EngineConfig, ExecutionOutput, FabricError, TaskEngine, TaskId, TaskRoutine,
    TaskStatus,
};

/// Fast-ticking engine config with persistence disabled
pub fn mem_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.tick_interval_ms = 10;
    config.priority_adjustment_interval_secs = 1;
    config.cancel_grace_ms = 200;
    config.persistence.enabled = false;
    config
}

/// Fast-ticking engine config persisting under `root`
pub fn disk_config(root: &Path) -> EngineConfig {
    let mut config = mem_config();
    config.persistence.enabled = true;
    config.persistence.root = root.to_path_buf();
    config.persistence.heartbeat_interval_secs = 1;
    config.persistence.checkpoint_interval_secs = 3600;
    config.persistence.session_timeout_secs = 60;
    config.persistence.performance.prefetch_enabled = false;
    config
}

/// Routine that sleeps briefly and succeeds
pub fn ok_routine(delay_ms: u64) -> Arc<dyn TaskRoutine> {
    routine_fn(move |_task, _ctx| async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        Ok(ExecutionOutput::success())
    })
}

/// Routine that never finishes on its own and ignores cancellation
pub fn hanging_routine() -> Arc<dyn TaskRoutine> {
    routine_fn(|_task, _ctx| async move {
        tokio::time::sleep(Duration::from_secs(600)).await;
        Ok(ExecutionOutput::success())
    })
}

/// Routine that waits for the cancel signal and returns promptly
pub fn cooperative_routine() -> Arc<dyn TaskRoutine> {
    routine_fn(|_task, ctx: taskfabric::ExecutionContext| async move {
        ctx.cancel.cancelled().await;
        Err(FabricError::Cancelled)
    })
}

/// Routine that fails retryably `failures` times, then succeeds
pub fn flaky_routine(failures: u32) -> Arc<dyn TaskRoutine> {
    let remaining = Arc::new(AtomicU32::new(failures));
    routine_fn(move |_task, _ctx| {
        let remaining = Arc::clone(&remaining);
        async move {
            if remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                .is_ok()
            {
                Err(FabricError::Execution {
                    message: "transient outage".into(),
                    retryable: true,
                })
            } else {
                Ok(ExecutionOutput::success())
            }
        }
    })
}

/// Routine that tracks its own concurrency high-water mark
pub fn counting_routine(
    delay_ms: u64,
) -> (Arc<dyn TaskRoutine>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let current2 = Arc::clone(&current);
    let peak2 = Arc::clone(&peak);
    let routine = routine_fn(move |_task, _ctx| {
        let current = Arc::clone(&current2);
        let peak = Arc::clone(&peak2);
        async move {
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            current.fetch_sub(1, Ordering::SeqCst);
            Ok(ExecutionOutput::success())
        }
    });
    (routine, current, peak)
}

/// Poll until the task reaches `status` or the timeout elapses
pub async fn wait_for_status(
    engine: &TaskEngine,
    id: TaskId,
    status: TaskStatus,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if let Some(task) = engine.get_task(id).await {
            if task.status == status {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Poll until the task is terminal, returning its final status
pub async fn wait_terminal(
    engine: &TaskEngine,
    id: TaskId,
    timeout: Duration,
) -> Option<TaskStatus> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if let Some(task) = engine.get_task(id).await {
            if task.status.is_terminal() {
                return Some(task.status);
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}
