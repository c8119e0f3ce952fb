//! Task specifications and execution contracts
//!
//! Callers describe work with a [`TaskSpec`] built through
//! [`TaskSpecBuilder`], which validates required fields and fills
//! defaults before anything enters the queue. The execution procedure is
//! a [`TaskRoutine`] — an opaque asynchronous operation from the core's
//! point of view. Routines receive an [`ExecutionContext`] carrying the
//! cooperative cancellation token and a progress hook, and return an
//! [`ExecutionOutput`] that may emit follow-up tasks.
//!
//! Routines are runtime handles: they are registered with the executor
//! alongside the task and are never serialized with it.

use crate::types::{
    FabricError, FabricResult, Priority, Task, TaskCategory, TaskId, TaskMetrics, TaskStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use validator::Validate;

/// Progress callback invoked with a completion fraction in `[0, 1]`
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// Context handed to a routine for one execution attempt
#[derive(Clone)]
pub struct ExecutionContext {
    /// Task being executed
    pub task_id: TaskId,
    /// 1-based attempt number (first run is 1)
    pub attempt: u32,
    /// Cooperative cancellation signal; poll or await this
    pub cancel: CancellationToken,
    /// Opaque caller context copied from the task
    pub metadata: HashMap<String, String>,
    progress: Option<ProgressFn>,
}

impl ExecutionContext {
    pub(crate) fn new(
        task_id: TaskId,
        attempt: u32,
        cancel: CancellationToken,
        metadata: HashMap<String, String>,
        progress: Option<ProgressFn>,
    ) -> Self {
        Self {
            task_id,
            attempt,
            cancel,
            metadata,
            progress,
        }
    }

    /// True once cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Report execution progress to the registered callback, if any
    pub fn report_progress(&self, fraction: f64) {
        if let Some(cb) = &self.progress {
            cb(fraction.clamp(0.0, 1.0));
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("task_id", &self.task_id)
            .field("attempt", &self.attempt)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Result of a successful execution attempt
#[derive(Debug, Default)]
pub struct ExecutionOutput {
    /// Arbitrary result payload
    pub result: Option<Value>,
    /// Paths/identifiers of artifacts produced by the routine
    pub artifacts: Vec<String>,
    /// Follow-up tasks; submitted with `parent_task_id` set
    pub next_tasks: Vec<TaskSpec>,
    /// Optional resource accounting reported by the routine
    pub cpu_seconds: Option<f64>,
    pub memory_peak_mb: Option<f64>,
}

impl ExecutionOutput {
    /// Empty successful output
    pub fn success() -> Self {
        Self::default()
    }

    pub fn with_result(mut self, value: Value) -> Self {
        self.result = Some(value);
        self
    }

    pub fn with_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifacts.push(artifact.into());
        self
    }

    pub fn with_next_task(mut self, spec: TaskSpec) -> Self {
        self.next_tasks.push(spec);
        self
    }
}

/// The caller-supplied execution contract
///
/// `execute` is required; `validate` runs before dispatch and `rollback`
/// after a terminal failure. Default implementations make the latter two
/// no-ops.
#[async_trait]
pub trait TaskRoutine: Send + Sync {
    /// Run the task. Respect `ctx.cancel` and return promptly when it
    /// fires; the executor abandons the attempt after the grace window.
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> FabricResult<ExecutionOutput>;

    /// Guard invoked before dispatch; an `Err` fails the attempt
    async fn validate(&self, _task: &Task, _ctx: &ExecutionContext) -> FabricResult<()> {
        Ok(())
    }

    /// Compensation hook invoked after a terminal failure
    async fn rollback(&self, _task: &Task, _ctx: &ExecutionContext) -> FabricResult<()> {
        Ok(())
    }
}

struct FnRoutine<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> TaskRoutine for FnRoutine<F>
where
    F: Fn(Task, ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = FabricResult<ExecutionOutput>> + Send,
{
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> FabricResult<ExecutionOutput> {
        (self.f)(task.clone(), ctx.clone()).await
    }
}

/// Wrap an async closure as a [`TaskRoutine`]
///
/// # Examples
/// ```
/// use taskfabric::{routine_fn, ExecutionOutput};
///
/// let routine = routine_fn(|_task, _ctx| async move {
///     Ok(ExecutionOutput::success())
/// });
/// # let _ = routine;
/// ```
pub fn routine_fn<F, Fut>(f: F) -> Arc<dyn TaskRoutine>
where
    F: Fn(Task, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FabricResult<ExecutionOutput>> + Send + 'static,
{
    Arc::new(FnRoutine { f })
}

/// Validated description of a unit of work
///
/// Construct through [`TaskSpec::builder`]; `build` rejects specs with
/// missing or out-of-range fields before they reach the queue.
#[derive(Clone, Validate)]
pub struct TaskSpec {
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[validate(length(min = 1, max = 2000))]
    pub description: String,
    pub category: TaskCategory,
    pub tags: Vec<String>,
    pub base_priority: Priority,
    pub deadline: Option<DateTime<Utc>>,
    pub estimated_duration_ms: u64,
    /// Overrides the engine default when set
    pub max_retries: Option<u32>,
    /// Per-task execution timeout override
    pub timeout_ms: Option<u64>,
    /// Hard dependencies registered at submission
    pub dependencies: Vec<TaskId>,
    /// Pool name → units to reserve while running
    pub resource_constraints: HashMap<String, u64>,
    pub pre_conditions: Vec<String>,
    pub post_conditions: Vec<String>,
    pub batch_compatible: bool,
    pub batch_group: Option<String>,
    #[validate(range(min = 0.0, max = 1.0))]
    pub user_importance: f64,
    pub metadata: HashMap<String, String>,
    pub(crate) routine: Arc<dyn TaskRoutine>,
    pub(crate) progress: Option<ProgressFn>,
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("title", &self.title)
            .field("category", &self.category)
            .field("base_priority", &self.base_priority)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

impl TaskSpec {
    /// Start building a spec from the three required fields
    pub fn builder(
        title: impl Into<String>,
        description: impl Into<String>,
        routine: Arc<dyn TaskRoutine>,
    ) -> TaskSpecBuilder {
        TaskSpecBuilder::new(title, description, routine)
    }

    pub(crate) fn routine(&self) -> Arc<dyn TaskRoutine> {
        Arc::clone(&self.routine)
    }

    pub(crate) fn progress(&self) -> Option<ProgressFn> {
        self.progress.clone()
    }

    /// Materialize a task record from this spec
    pub(crate) fn into_task(self, id: TaskId, default_max_retries: u32) -> Task {
        let now = Utc::now();
        let required_resources = self.resource_constraints.keys().cloned().collect();
        Task {
            id,
            title: self.title,
            description: self.description,
            category: self.category,
            tags: self.tags,
            base_priority: self.base_priority,
            dynamic_priority: self.base_priority.score(),
            boosted_tier: None,
            priority_factors: Default::default(),
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            deadline: self.deadline,
            estimated_duration_ms: self.estimated_duration_ms,
            actual_duration_ms: None,
            timeout_ms: self.timeout_ms,
            max_retries: self.max_retries.unwrap_or(default_max_retries),
            current_retries: 0,
            next_attempt_at: None,
            status: TaskStatus::Pending,
            dependencies: self.dependencies,
            dependents: Vec::new(),
            required_resources,
            resource_constraints: self.resource_constraints,
            pre_conditions: self.pre_conditions,
            post_conditions: self.post_conditions,
            batch_compatible: self.batch_compatible,
            batch_group: self.batch_group,
            user_importance: self.user_importance,
            parent_task_id: None,
            last_error: None,
            retry_history: Vec::new(),
            metrics: TaskMetrics::default(),
            metadata: self.metadata,
        }
    }
}

/// Builder for [`TaskSpec`]
pub struct TaskSpecBuilder {
    spec: TaskSpec,
}

impl TaskSpecBuilder {
    fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        routine: Arc<dyn TaskRoutine>,
    ) -> Self {
        Self {
            spec: TaskSpec {
                title: title.into(),
                description: description.into(),
                category: TaskCategory::default(),
                tags: Vec::new(),
                base_priority: Priority::default(),
                deadline: None,
                estimated_duration_ms: 60_000,
                max_retries: None,
                timeout_ms: None,
                dependencies: Vec::new(),
                resource_constraints: HashMap::new(),
                pre_conditions: Vec::new(),
                post_conditions: Vec::new(),
                batch_compatible: false,
                batch_group: None,
                user_importance: 0.5,
                metadata: HashMap::new(),
                routine,
                progress: None,
            },
        }
    }

    pub fn category(mut self, category: TaskCategory) -> Self {
        self.spec.category = category;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.spec.tags.push(tag.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.spec.base_priority = priority;
        self
    }

    pub fn deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.spec.deadline = Some(deadline);
        self
    }

    pub fn estimated_duration_ms(mut self, ms: u64) -> Self {
        self.spec.estimated_duration_ms = ms;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.spec.max_retries = Some(retries);
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.spec.timeout_ms = Some(ms);
        self
    }

    pub fn depends_on(mut self, id: TaskId) -> Self {
        self.spec.dependencies.push(id);
        self
    }

    pub fn resource(mut self, pool: impl Into<String>, amount: u64) -> Self {
        self.spec.resource_constraints.insert(pool.into(), amount);
        self
    }

    pub fn pre_condition(mut self, expr: impl Into<String>) -> Self {
        self.spec.pre_conditions.push(expr.into());
        self
    }

    pub fn post_condition(mut self, expr: impl Into<String>) -> Self {
        self.spec.post_conditions.push(expr.into());
        self
    }

    pub fn batch_group(mut self, group: impl Into<String>) -> Self {
        self.spec.batch_group = Some(group.into());
        self.spec.batch_compatible = true;
        self
    }

    pub fn user_importance(mut self, importance: f64) -> Self {
        self.spec.user_importance = importance;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.metadata.insert(key.into(), value.into());
        self
    }

    pub fn on_progress(mut self, callback: ProgressFn) -> Self {
        self.spec.progress = Some(callback);
        self
    }

    /// Validate and produce the spec
    pub fn build(self) -> FabricResult<TaskSpec> {
        self.spec.validate()?;
        if self.spec.estimated_duration_ms == 0 {
            return Err(FabricError::Validation(
                "estimated_duration_ms must be positive".into(),
            ));
        }
        if let Some(0) = self.spec.timeout_ms {
            return Err(FabricError::Validation(
                "timeout_ms must be positive".into(),
            ));
        }
        Ok(self.spec)
    }
}

/// Evaluate guard expressions against a task's metadata context.
///
/// Grammar is deliberately small: `key` (exists), `key=value`,
/// `key!=value`. Returns the first failing expression. Unparsable
/// expressions fail closed.
pub(crate) fn conditions_pass(
    conditions: &[String],
    context: &HashMap<String, String>,
) -> Result<(), String> {
    for cond in conditions {
        let ok = if let Some((key, value)) = cond.split_once("!=") {
            context.get(key.trim()).map(String::as_str) != Some(value.trim())
        } else if let Some((key, value)) = cond.split_once('=') {
            context.get(key.trim()).map(String::as_str) == Some(value.trim())
        } else {
            let key = cond.trim();
            if key.is_empty() {
                warn!(condition = %cond, "unparsable condition fails closed");
                false
            } else {
                context.contains_key(key)
            }
        };
        if !ok {
            return Err(cond.clone());
        }
    }
    Ok(())
}

/// Hook point for pluggable task decomposition policies
///
/// The default engine does no decomposition; installing a policy lets
/// submitted tasks be broken into subtasks before they queue.
#[async_trait]
pub trait DecompositionPolicy: Send + Sync {
    /// Return subtask specs for the given task, or `None` to leave it whole
    async fn decompose(&self, task: &Task) -> Option<Vec<TaskSpec>>;
}

/// Prediction of a task's runtime behavior
#[derive(Debug, Clone, Copy)]
pub struct Prediction {
    pub expected_duration_ms: u64,
    /// Probability of success in `[0, 1]`
    pub success_probability: f64,
}

/// Pluggable predictor consumed by the ML-optimized scheduler
pub trait TaskPredictor: Send + Sync {
    fn predict(&self, task: &Task) -> Prediction;
}
