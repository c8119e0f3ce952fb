//! Task executor
//!
//! Runs dispatched tasks concurrently up to the worker budget. Each task
//! gets a child cancellation token and a wall-clock deadline; outcomes
//! flow back to the engine over a completion channel rather than through
//! shared mutable state.
//!
//! Cancellation is cooperative: the routine sees the token through its
//! execution context and is expected to return promptly. If it does not
//! return within the grace window the attempt is abandoned, reported as
//! cancelled, and a leaked-work warning is logged.

use crate::spec::{ExecutionContext, ExecutionOutput, ProgressFn, TaskRoutine};
use crate::types::{ErrorKind, FabricError, FabricResult, Task, TaskId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Base delay of the retry backoff schedule
const BACKOFF_BASE_MS: u64 = 500;
/// Upper bound on a single backoff delay
const BACKOFF_CAP_MS: u64 = 60_000;
/// Jitter applied around the exponential delay (±20 %)
const BACKOFF_JITTER: f64 = 0.2;

/// How one execution attempt ended
#[derive(Debug)]
pub enum TaskOutcome {
    Success(ExecutionOutput),
    Failure(FabricError),
    TimedOut(Duration),
    Cancelled {
        /// True when the routine ignored the cancel signal and was
        /// abandoned after the grace window
        leaked: bool,
    },
}

/// Message sent to the engine when an attempt finishes
#[derive(Debug)]
pub struct Completion {
    pub task_id: TaskId,
    /// 1-based attempt number
    pub attempt: u32,
    pub outcome: TaskOutcome,
    /// Wall-clock duration of the attempt
    pub duration_ms: u64,
}

struct RunningEntry {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Worker pool executing dispatched tasks
pub struct Executor {
    max_concurrent: usize,
    cancel_grace: Duration,
    running: Arc<RwLock<HashMap<TaskId, RunningEntry>>>,
    completion_tx: async_channel::Sender<Completion>,
}

impl Executor {
    /// Create an executor; the returned receiver is the engine's
    /// completion pipeline
    pub fn new(
        max_concurrent: usize,
        cancel_grace: Duration,
    ) -> (Self, async_channel::Receiver<Completion>) {
        let (completion_tx, completion_rx) = async_channel::unbounded();
        (
            Self {
                max_concurrent,
                cancel_grace,
                running: Arc::new(RwLock::new(HashMap::new())),
                completion_tx,
            },
            completion_rx,
        )
    }

    /// Number of attempts currently in flight
    pub async fn running_count(&self) -> usize {
        self.running.read().await.len()
    }

    /// Ids of tasks currently in flight
    pub async fn running_ids(&self) -> Vec<TaskId> {
        self.running.read().await.keys().copied().collect()
    }

    pub async fn is_running(&self, id: TaskId) -> bool {
        self.running.read().await.contains_key(&id)
    }

    /// Spawn one execution attempt.
    ///
    /// The engine is responsible for keeping dispatches within the
    /// budget; exceeding it here is an internal error.
    pub async fn dispatch(
        &self,
        task: Task,
        routine: Arc<dyn TaskRoutine>,
        progress: Option<ProgressFn>,
        execution_timeout: Duration,
        parent: &CancellationToken,
    ) -> FabricResult<()> {
        let task_id = task.id;
        let attempt = task.current_retries + 1;
        let cancel = parent.child_token();
        let ctx = ExecutionContext::new(
            task_id,
            attempt,
            cancel.clone(),
            task.metadata.clone(),
            progress,
        );

        // The registry lock is held across spawn and insert so the
        // spawned attempt cannot observe itself missing from it.
        let mut entries = self.running.write().await;
        if entries.len() >= self.max_concurrent {
            return Err(FabricError::Internal(format!(
                "worker budget exhausted ({} running)",
                entries.len()
            )));
        }
        if entries.contains_key(&task_id) {
            return Err(FabricError::Internal(format!(
                "task {task_id} is already running"
            )));
        }

        let running = Arc::clone(&self.running);
        let completion_tx = self.completion_tx.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let outcome = match routine.validate(&task, &ctx).await {
                Err(e) => TaskOutcome::Failure(e),
                Ok(()) => match timeout(execution_timeout, routine.execute(&task, &ctx)).await {
                    Err(_) => TaskOutcome::TimedOut(execution_timeout),
                    Ok(Ok(output)) => {
                        if token.is_cancelled() {
                            TaskOutcome::Cancelled { leaked: false }
                        } else {
                            TaskOutcome::Success(output)
                        }
                    }
                    Ok(Err(e)) if e.kind() == ErrorKind::Cancelled => {
                        TaskOutcome::Cancelled { leaked: false }
                    }
                    Ok(Err(e)) => TaskOutcome::Failure(e),
                },
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            // If the grace watcher already abandoned this attempt the
            // entry is gone and the completion was reported there.
            let owned = running.write().await.remove(&task_id).is_some();
            if owned {
                let _ = completion_tx
                    .send(Completion {
                        task_id,
                        attempt,
                        outcome,
                        duration_ms,
                    })
                    .await;
            }
        });

        entries.insert(task_id, RunningEntry { handle, cancel });
        drop(entries);
        debug!(%task_id, attempt, "dispatched");
        Ok(())
    }

    /// Signal cooperative cancellation of a running attempt.
    ///
    /// Returns false when the task is not currently running. A watcher
    /// enforces the grace window and abandons the attempt if the routine
    /// does not return in time.
    pub async fn cancel(&self, task_id: TaskId) -> bool {
        let token = {
            let running = self.running.read().await;
            match running.get(&task_id) {
                Some(entry) => entry.cancel.clone(),
                None => return false,
            }
        };
        token.cancel();

        let running = Arc::clone(&self.running);
        let completion_tx = self.completion_tx.clone();
        let grace = self.cancel_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let abandoned = running.write().await.remove(&task_id);
            if let Some(entry) = abandoned {
                entry.handle.abort();
                warn!(%task_id, ?grace, "routine ignored cancel signal; abandoning leaked work");
                let _ = completion_tx
                    .send(Completion {
                        task_id,
                        attempt: 0,
                        outcome: TaskOutcome::Cancelled { leaked: true },
                        duration_ms: 0,
                    })
                    .await;
            }
        });
        true
    }

    /// Signal cancellation to every running attempt
    pub async fn cancel_all(&self) -> Vec<TaskId> {
        let ids = self.running_ids().await;
        for id in &ids {
            self.cancel(*id).await;
        }
        ids
    }
}

/// Exponential retry backoff: `500ms × 2^(attempt-1)`, ±20 % jitter,
/// capped at 60 s
pub(crate) fn retry_backoff(attempt: u32) -> Duration {
    use rand::Rng;
    let exp = BACKOFF_BASE_MS.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1).min(16)));
    let capped = exp.min(BACKOFF_CAP_MS) as f64;
    let jitter = rand::thread_rng().gen_range(1.0 - BACKOFF_JITTER..=1.0 + BACKOFF_JITTER);
    Duration::from_millis((capped * jitter).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::routine_fn;
    use crate::types::{
        Priority, PriorityFactors, TaskCategory, TaskMetrics, TaskStatus,
    };
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_task() -> Task {
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
            status: TaskStatus::Queued,
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
    async fn test_success_completion() {
        let (executor, rx) = Executor::new(2, Duration::from_millis(100));
        let routine = routine_fn(|_t, _c| async move {
            Ok(ExecutionOutput::success().with_result(serde_json::json!({"ok": true})))
        });
        let task = sample_task();
        let root = CancellationToken::new();

        executor
            .dispatch(task.clone(), routine, None, Duration::from_secs(5), &root)
            .await
            .unwrap();

        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.task_id, task.id);
        assert_eq!(completion.attempt, 1);
        assert!(matches!(completion.outcome, TaskOutcome::Success(_)));
        assert_eq!(executor.running_count().await, 0);
    }

    #[tokio::test]
    async fn test_failure_completion() {
        let (executor, rx) = Executor::new(2, Duration::from_millis(100));
        let routine = routine_fn(|_t, _c| async move {
            Err(FabricError::Execution {
                message: "boom".into(),
                retryable: true,
            })
        });
        let root = CancellationToken::new();
        executor
            .dispatch(sample_task(), routine, None, Duration::from_secs(5), &root)
            .await
            .unwrap();

        let completion = rx.recv().await.unwrap();
        match completion.outcome {
            TaskOutcome::Failure(e) => assert!(e.is_retryable()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_distinguished() {
        let (executor, rx) = Executor::new(2, Duration::from_millis(100));
        let routine = routine_fn(|_t, _c| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(ExecutionOutput::success())
        });
        let root = CancellationToken::new();
        executor
            .dispatch(
                sample_task(),
                routine,
                None,
                Duration::from_millis(50),
                &root,
            )
            .await
            .unwrap();

        let completion = rx.recv().await.unwrap();
        assert!(matches!(completion.outcome, TaskOutcome::TimedOut(_)));
    }

    #[tokio::test]
    async fn test_cooperative_cancel() {
        let (executor, rx) = Executor::new(2, Duration::from_millis(500));
        let routine = routine_fn(|_t, ctx: ExecutionContext| async move {
            ctx.cancel.cancelled().await;
            Err(FabricError::Cancelled)
        });
        let task = sample_task();
        let root = CancellationToken::new();
        executor
            .dispatch(task.clone(), routine, None, Duration::from_secs(30), &root)
            .await
            .unwrap();

        assert!(executor.cancel(task.id).await);
        let completion = rx.recv().await.unwrap();
        assert!(matches!(
            completion.outcome,
            TaskOutcome::Cancelled { leaked: false }
        ));
    }

    #[tokio::test]
    async fn test_uncooperative_routine_is_abandoned() {
        let (executor, rx) = Executor::new(2, Duration::from_millis(50));
        // ignores the token entirely
        let routine = routine_fn(|_t, _c| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ExecutionOutput::success())
        });
        let task = sample_task();
        let root = CancellationToken::new();
        executor
            .dispatch(task.clone(), routine, None, Duration::from_secs(60), &root)
            .await
            .unwrap();

        executor.cancel(task.id).await;
        let completion = rx.recv().await.unwrap();
        assert!(matches!(
            completion.outcome,
            TaskOutcome::Cancelled { leaked: true }
        ));
        assert_eq!(executor.running_count().await, 0);
    }

    #[tokio::test]
    async fn test_budget_enforced() {
        let (executor, _rx) = Executor::new(1, Duration::from_millis(100));
        let slow = routine_fn(|_t, _c| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(ExecutionOutput::success())
        });
        let root = CancellationToken::new();
        executor
            .dispatch(sample_task(), slow.clone(), None, Duration::from_secs(30), &root)
            .await
            .unwrap();

        let err = executor
            .dispatch(sample_task(), slow, None, Duration::from_secs(30), &root)
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::Internal(_)));
    }

    #[test]
    fn test_backoff_schedule() {
        for attempt in 1..=20 {
            let d = retry_backoff(attempt).as_millis() as u64;
            assert!(d <= (BACKOFF_CAP_MS as f64 * 1.2) as u64, "attempt {attempt}: {d}");
        }
        // first attempt centers on the base delay
        let d1 = retry_backoff(1).as_millis() as f64;
        assert!((400.0..=600.0).contains(&d1), "got {d1}");
        // grows monotonically in expectation: take mid-range samples
        let d3 = retry_backoff(3).as_millis() as f64;
        assert!(d3 >= d1, "expected growth, got {d1} then {d3}");
    }
}
