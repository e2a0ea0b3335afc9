//! Task model: lifecycle, handlers, registry, and execution context
//!
//! A [`Task`] is a typed unit of work inside a [`TaskGraph`](crate::graph::TaskGraph).
//! Its behavior lives in a [`TaskHandler`] - an object-safe trait registered by
//! type string in a [`TaskRegistry`] - while the `Task` itself owns the runtime
//! state: status, input/output of the current run, progress, error, and an
//! optional sub-graph when array-expanded.
//!
//! # Lifecycle
//!
//! ```text
//! PENDING ──start──▶ PROCESSING ──success──▶ COMPLETED
//!                 │              ──error────▶ FAILED
//!                 └──abort()────▶ ABORTING ──▶ FAILED
//! PENDING ──disable()──▶ DISABLED
//! ```
//!
//! `COMPLETED`, `FAILED`, and `DISABLED` are terminal; `ABORTING` is transient
//! and must resolve to `FAILED` within the runner's grace period. Progress is
//! monotonic within a run and resets when a run starts. `run_output_data` is
//! only meaningful while the status is `COMPLETED`.
//!
//! # Execution paths
//!
//! | Method              | When                                            |
//! |---------------------|-------------------------------------------------|
//! | `execute`           | Authoritative, possibly expensive/side-effectful |
//! | `execute_reactive`  | Cheap recomputation on upstream change (pure)   |
//! | `execute_stream`    | Chunked production for streaming output ports   |
//! | `execute_merge`     | Combine per-replica outputs in array mode       |

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, TaskGraphError};
use crate::events::EventBus;
use crate::graph::TaskGraph;
use crate::retry::RetryPolicy;
use crate::runner::CleanupRegistry;
use crate::runtime::ServiceContainer;
use crate::schema::ObjectSchema;
use crate::stream::{StreamReceiver, TaskEventStream, StreamEvent};

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Not yet started (initial state, and the state restored work resumes from)
    Pending,
    /// Currently executing
    Processing,
    /// Finished successfully; `run_output_data` is valid
    Completed,
    /// Finished with an error (including cancelled runs)
    Failed,
    /// Cancellation observed, still winding down
    Aborting,
    /// Excluded from execution
    Disabled,
}

impl TaskStatus {
    /// Whether this status ends the task's run
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Disabled)
    }

    /// Whether the state machine permits `self -> next`
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Disabled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Aborting)
                | (Aborting, Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Aborting => "ABORTING",
            TaskStatus::Disabled => "DISABLED",
        };
        write!(f, "{name}")
    }
}

/// Events emitted by one task during its lifecycle
///
/// Any single subscriber observes a prefix of
/// `Start · Progress* · (StreamStart · StreamChunk* · StreamEnd)? ·
/// (Complete | Error | Abort·Error)`.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// The run began
    Start,
    /// In-task progress report
    Progress {
        /// Percentage in `[0, 100]`, monotonic within a run
        progress: f32,
        /// Optional human-readable message
        message: Option<String>,
        /// Optional structured details
        details: Option<Value>,
    },
    /// Streaming output began
    StreamStart,
    /// One streaming chunk
    StreamChunk {
        /// The chunk
        event: StreamEvent,
    },
    /// Streaming output finished with the aggregate value
    StreamEnd {
        /// The materialized output
        output: Value,
    },
    /// The run completed successfully
    Complete {
        /// The task's output
        output: Value,
    },
    /// The run failed
    Error {
        /// Failure message
        error: String,
    },
    /// Cancellation was observed
    Abort,
    /// The sub-graph was rebuilt after an input change
    Regenerate,
    /// Non-fatal advisory (e.g. empty replicated input)
    Warning {
        /// Advisory message
        message: String,
    },
}

/// Static configuration of a task instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Stable id; generated when empty
    #[serde(default)]
    pub id: String,
    /// Machine name
    #[serde(default)]
    pub name: String,
    /// Display title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Retry policy applied by queue-backed execution
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            title: None,
            retry: RetryPolicy::none(),
        }
    }
}

impl TaskConfig {
    /// Config with an explicit id
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Set the machine name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Behavior contract of a task type
///
/// Handlers are stateless and shared; all per-run state lives on the [`Task`].
/// Only `execute` is mandatory. Implementations overriding `execute_reactive`
/// should also override [`TaskHandler::reactive_safe`] to return `true` so the
/// reactive runner will call it.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Registered type string
    fn task_type(&self) -> &str;

    /// Declared input ports
    fn input_schema(&self) -> ObjectSchema;

    /// Declared output ports
    fn output_schema(&self) -> ObjectSchema;

    /// Grouping category for catalogs
    fn category(&self) -> &str {
        "general"
    }

    /// Display title
    fn title(&self) -> String {
        self.task_type().to_string()
    }

    /// Human description
    fn description(&self) -> String {
        String::new()
    }

    /// Whether identical inputs may be served from the output cache
    fn cacheable(&self) -> bool {
        false
    }

    /// Whether `execute_stream` is implemented
    fn streamable(&self) -> bool {
        false
    }

    /// Whether `execute_reactive` is implemented and side-effect free
    fn reactive_safe(&self) -> bool {
        false
    }

    /// Authoritative execution
    async fn execute(&self, input: Value, ctx: TaskContext) -> Result<Value>;

    /// Cheap recomputation after an upstream change; must be pure and fast
    async fn execute_reactive(
        &self,
        _input: Value,
        prior_output: Option<Value>,
        _ctx: TaskContext,
    ) -> Result<Value> {
        Ok(prior_output.unwrap_or(Value::Null))
    }

    /// Chunked execution; the final `Finish` event carries the aggregate output
    fn execute_stream(&self, _input: Value, _ctx: TaskContext) -> Result<TaskEventStream> {
        Err(TaskGraphError::configuration(format!(
            "task type '{}' does not implement streaming",
            self.task_type()
        )))
    }

    /// Combine per-replica outputs into the aggregate output (array mode)
    ///
    /// The default concatenates values on replicated output ports (preserving
    /// child order) and takes scalars from the first child.
    fn execute_merge(&self, _input: &Value, child_outputs: &[Value]) -> Result<Value> {
        Ok(default_merge(&self.output_schema(), child_outputs))
    }
}

impl std::fmt::Debug for dyn TaskHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandler")
            .field("task_type", &self.task_type())
            .finish()
    }
}

/// Default array-mode merge: replicated ports concatenate, scalars come from
/// the first child
pub fn default_merge(output_schema: &ObjectSchema, child_outputs: &[Value]) -> Value {
    let mut merged = serde_json::Map::new();
    for (name, port) in output_schema.iter() {
        if port.replicate {
            let values: Vec<Value> = child_outputs
                .iter()
                .map(|output| output.get(name).cloned().unwrap_or(Value::Null))
                .collect();
            merged.insert(name.to_string(), Value::Array(values));
        } else if let Some(first) = child_outputs.first() {
            if let Some(value) = first.get(name) {
                merged.insert(name.to_string(), value.clone());
            }
        }
    }
    Value::Object(merged)
}

/// Registry of task handlers keyed by type string
///
/// The registry is a dependency-injected collaborator (passed through
/// [`ServiceContainer`]); nothing in the engine consults a process global.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<dyn TaskHandler>>>>,
}

impl TaskRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; rejects duplicate type strings
    pub fn register(&self, handler: Arc<dyn TaskHandler>) -> Result<()> {
        let task_type = handler.task_type().to_string();
        let mut handlers = self.inner.write();
        if handlers.contains_key(&task_type) {
            return Err(TaskGraphError::configuration(format!(
                "task type '{task_type}' is already registered"
            )));
        }
        handlers.insert(task_type, handler);
        Ok(())
    }

    /// Resolve a handler by type string
    pub fn get(&self, task_type: &str) -> Result<Arc<dyn TaskHandler>> {
        self.inner
            .read()
            .get(task_type)
            .cloned()
            .ok_or_else(|| {
                TaskGraphError::configuration(format!("unknown task type '{task_type}'"))
            })
    }

    /// Whether a type is registered
    pub fn contains(&self, task_type: &str) -> bool {
        self.inner.read().contains_key(task_type)
    }

    /// All registered type strings (sorted)
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.inner.read().keys().cloned().collect();
        types.sort();
        types
    }
}

struct TaskRunState {
    status: TaskStatus,
    run_input: Option<Value>,
    run_output: Option<Value>,
    progress: f32,
    error: Option<String>,
    stale: bool,
}

/// A task instance inside a graph
///
/// Cheap to share via `Arc`; all runtime state is interior-mutable and
/// guarded. The task exclusively owns its sub-graph (children reference the
/// parent by id only).
pub struct Task {
    id: String,
    task_type: String,
    config: TaskConfig,
    handler: Arc<dyn TaskHandler>,
    state: RwLock<TaskRunState>,
    events: EventBus<TaskEvent>,
    sub_graph: RwLock<Option<Arc<TaskGraph>>>,
    parent_task_id: RwLock<Option<String>>,
}

impl Task {
    /// Create a task from a handler and config; generates an id when absent
    pub fn new(handler: Arc<dyn TaskHandler>, mut config: TaskConfig) -> Self {
        if config.id.is_empty() {
            config.id = Uuid::new_v4().to_string();
        }
        Self {
            id: config.id.clone(),
            task_type: handler.task_type().to_string(),
            config,
            handler,
            state: RwLock::new(TaskRunState {
                status: TaskStatus::Pending,
                run_input: None,
                run_output: None,
                progress: 0.0,
                error: None,
                stale: false,
            }),
            events: EventBus::new(),
            sub_graph: RwLock::new(None),
            parent_task_id: RwLock::new(None),
        }
    }

    /// Immutable id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Registered type string
    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    /// Static configuration
    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    /// The behavior implementation
    pub fn handler(&self) -> &Arc<dyn TaskHandler> {
        &self.handler
    }

    /// This task's event bus
    pub fn events(&self) -> &EventBus<TaskEvent> {
        &self.events
    }

    /// Declared input ports
    pub fn input_schema(&self) -> ObjectSchema {
        self.handler.input_schema()
    }

    /// Declared output ports
    pub fn output_schema(&self) -> ObjectSchema {
        self.handler.output_schema()
    }

    /// Current lifecycle status
    pub fn status(&self) -> TaskStatus {
        self.state.read().status
    }

    /// Progress in `[0, 100]`
    pub fn progress(&self) -> f32 {
        self.state.read().progress
    }

    /// Input of the current/last run
    pub fn run_input(&self) -> Option<Value> {
        self.state.read().run_input.clone()
    }

    /// Output of the last completed run
    pub fn run_output(&self) -> Option<Value> {
        self.state.read().run_output.clone()
    }

    /// Failure message of the last run
    pub fn error(&self) -> Option<String> {
        self.state.read().error.clone()
    }

    /// Whether a reactive pass marked this task's output out-of-date
    pub fn is_stale(&self) -> bool {
        self.state.read().stale
    }

    /// Mark the task's output stale (awaiting a full execute)
    pub fn set_stale(&self, stale: bool) {
        self.state.write().stale = stale;
    }

    /// The sub-graph, when array-expanded or composite
    pub fn sub_graph(&self) -> Option<Arc<TaskGraph>> {
        self.sub_graph.read().clone()
    }

    /// Install a (re)built sub-graph, emitting [`TaskEvent::Regenerate`] when
    /// one was already present
    pub fn set_sub_graph(&self, graph: Arc<TaskGraph>) {
        let regenerated = {
            let mut slot = self.sub_graph.write();
            let had = slot.is_some();
            *slot = Some(graph);
            had
        };
        if regenerated {
            self.events.emit(TaskEvent::Regenerate);
        }
    }

    /// Parent task id when this task is a sub-graph child
    pub fn parent_task_id(&self) -> Option<String> {
        self.parent_task_id.read().clone()
    }

    /// Record the owning parent (by id, never by pointer)
    pub fn set_parent_task_id(&self, parent: impl Into<String>) {
        *self.parent_task_id.write() = Some(parent.into());
    }

    /// Exclude the task from execution (PENDING only)
    pub fn disable(&self) -> Result<()> {
        self.transition(TaskStatus::Disabled)
    }

    /// Transition `PENDING -> PROCESSING`: reset progress, clear error, record
    /// the run input, emit [`TaskEvent::Start`]
    pub fn begin_run(&self, input: Value) -> Result<()> {
        {
            let mut state = self.state.write();
            if !state.status.can_transition_to(TaskStatus::Processing) {
                return Err(TaskGraphError::Fatal(format!(
                    "task '{}' cannot start from status {}",
                    self.id, state.status
                )));
            }
            state.status = TaskStatus::Processing;
            state.progress = 0.0;
            state.error = None;
            state.run_input = Some(input);
            state.run_output = None;
            state.stale = false;
        }
        debug!(task_id = %self.id, task_type = %self.task_type, "task started");
        self.events.emit(TaskEvent::Start);
        Ok(())
    }

    /// Transition to `COMPLETED` with the run's output
    pub fn complete(&self, output: Value) -> Result<()> {
        {
            let mut state = self.state.write();
            if !state.status.can_transition_to(TaskStatus::Completed) {
                return Err(TaskGraphError::Fatal(format!(
                    "task '{}' cannot complete from status {}",
                    self.id, state.status
                )));
            }
            state.status = TaskStatus::Completed;
            state.progress = 100.0;
            state.run_output = Some(output.clone());
        }
        self.events.emit(TaskEvent::Complete { output });
        Ok(())
    }

    /// Transition to `FAILED`, recording the error
    pub fn fail(&self, error: &TaskGraphError) {
        let message = error.to_string();
        {
            let mut state = self.state.write();
            state.status = TaskStatus::Failed;
            state.error = Some(message.clone());
        }
        self.events.emit(TaskEvent::Error { error: message });
    }

    /// Transition `PROCESSING -> ABORTING`, emitting [`TaskEvent::Abort`]
    pub fn begin_abort(&self) {
        let transitioned = {
            let mut state = self.state.write();
            if state.status.can_transition_to(TaskStatus::Aborting) {
                state.status = TaskStatus::Aborting;
                true
            } else {
                false
            }
        };
        if transitioned {
            self.events.emit(TaskEvent::Abort);
        }
    }

    /// Return a terminal task to `PENDING` for a re-run
    pub fn reset(&self) {
        let mut state = self.state.write();
        state.status = TaskStatus::Pending;
        state.progress = 0.0;
        state.error = None;
        state.run_output = None;
        state.stale = false;
    }

    /// Monotonic progress report: regressions are clamped to the current value
    pub fn report_progress(&self, progress: f32, message: Option<String>, details: Option<Value>) {
        let clamped = {
            let mut state = self.state.write();
            let next = progress.clamp(state.progress, 100.0);
            state.progress = next;
            next
        };
        self.events.emit(TaskEvent::Progress {
            progress: clamped,
            message,
            details,
        });
    }

    /// Emit [`TaskEvent::StreamStart`]
    pub fn emit_stream_start(&self) {
        self.events.emit(TaskEvent::StreamStart);
    }

    /// Emit one streaming chunk
    pub fn emit_stream_chunk(&self, event: StreamEvent) {
        self.events.emit(TaskEvent::StreamChunk { event });
    }

    /// Emit [`TaskEvent::StreamEnd`] with the materialized output
    pub fn emit_stream_end(&self, output: Value) {
        self.events.emit(TaskEvent::StreamEnd { output });
    }

    /// Emit a non-fatal advisory
    pub fn emit_warning(&self, message: impl Into<String>) {
        self.events.emit(TaskEvent::Warning {
            message: message.into(),
        });
    }

    /// Atomically replace the run output without touching status
    ///
    /// This is the reactive runner's write path; it never advances a task past
    /// its prior completion.
    pub fn set_run_output(&self, output: Value) {
        self.state.write().run_output = Some(output);
    }

    /// Replace the recorded run input (programmatic `set_input`)
    pub fn set_run_input(&self, input: Value) {
        self.state.write().run_input = Some(input);
    }

    /// Restore persisted runtime state (checkpoint resumption)
    pub fn restore_state(
        &self,
        status: TaskStatus,
        run_input: Option<Value>,
        run_output: Option<Value>,
        progress: f32,
        error: Option<String>,
    ) {
        let mut state = self.state.write();
        // ABORTING and PROCESSING do not survive a restart; resume from PENDING.
        state.status = match status {
            TaskStatus::Processing | TaskStatus::Aborting => TaskStatus::Pending,
            other => other,
        };
        state.run_input = run_input;
        state.run_output = run_output;
        state.progress = progress;
        state.error = error;
        state.stale = false;
    }

    fn transition(&self, next: TaskStatus) -> Result<()> {
        let mut state = self.state.write();
        if !state.status.can_transition_to(next) {
            return Err(TaskGraphError::Fatal(format!(
                "task '{}' cannot transition {} -> {}",
                self.id, state.status, next
            )));
        }
        state.status = next;
        Ok(())
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("task_type", &self.task_type)
            .field("status", &self.status())
            .field("progress", &self.progress())
            .finish_non_exhaustive()
    }
}

/// Per-run execution context handed to handlers
///
/// Clone-cheap; handlers may move clones into spawned work but must keep
/// observing [`TaskContext::token`].
#[derive(Clone)]
pub struct TaskContext {
    task: Arc<Task>,
    token: CancellationToken,
    services: ServiceContainer,
    input_streams: Arc<Mutex<HashMap<String, StreamReceiver>>>,
    cleanup: Option<CleanupRegistry>,
}

impl TaskContext {
    /// Build a context for one run of `task`
    pub fn new(task: Arc<Task>, token: CancellationToken, services: ServiceContainer) -> Self {
        Self {
            task,
            token,
            services,
            input_streams: Arc::new(Mutex::new(HashMap::new())),
            cleanup: None,
        }
    }

    /// Attach the run's cleanup registry
    pub fn with_cleanup(mut self, cleanup: CleanupRegistry) -> Self {
        self.cleanup = Some(cleanup);
        self
    }

    /// Attach a live input stream for `port`
    pub fn attach_input_stream(&self, port: impl Into<String>, receiver: StreamReceiver) {
        self.input_streams.lock().insert(port.into(), receiver);
    }

    /// Take the live stream for an input port, if one was attached
    ///
    /// Pass-through streaming edges deliver their chunks here; the port's
    /// value in the input object stays `null` until the stream finishes.
    pub fn take_input_stream(&self, port: &str) -> Option<StreamReceiver> {
        self.input_streams.lock().remove(port)
    }

    /// Id of the executing task
    pub fn task_id(&self) -> &str {
        self.task.id()
    }

    /// The executing task
    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// Cancellation signal for this run
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Error out if cancellation was requested
    pub fn check_cancelled(&self) -> Result<()> {
        if self.token.is_cancelled() {
            Err(TaskGraphError::Cancelled {
                task: Some(self.task.id().to_string()),
            })
        } else {
            Ok(())
        }
    }

    /// Report progress (monotonic, `[0, 100]`) with optional message/details
    pub fn update_progress(&self, progress: f32, message: Option<&str>, details: Option<Value>) {
        self.task
            .report_progress(progress, message.map(str::to_string), details);
    }

    /// Injected collaborators (registry, cache)
    pub fn services(&self) -> &ServiceContainer {
        &self.services
    }

    /// Register a run-scoped cleanup callback, deduplicated by `key`
    ///
    /// Callbacks run exactly once when the run ends, on every path.
    pub fn on_cleanup(&self, key: impl Into<String>, callback: impl FnOnce() + Send + 'static) {
        if let Some(cleanup) = &self.cleanup {
            cleanup.register(key, callback);
        }
    }
}

/// Closure-backed [`TaskHandler`] for tests and ad-hoc tasks
///
/// ```rust,ignore
/// let upper = FnTaskHandler::new(
///     "upper",
///     ObjectSchema::new().with_port("text", PortSchema::text()),
///     ObjectSchema::new().with_port("text", PortSchema::text()),
///     |input, _ctx| async move {
///         let text = input["text"].as_str().unwrap_or_default().to_uppercase();
///         Ok(json!({ "text": text }))
///     },
/// );
/// ```
pub struct FnTaskHandler<F> {
    task_type: String,
    input_schema: ObjectSchema,
    output_schema: ObjectSchema,
    cacheable: bool,
    execute: F,
}

impl<F, Fut> FnTaskHandler<F>
where
    F: Fn(Value, TaskContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value>> + Send,
{
    /// Wrap a closure as a handler
    pub fn new(
        task_type: impl Into<String>,
        input_schema: ObjectSchema,
        output_schema: ObjectSchema,
        execute: F,
    ) -> Self {
        Self {
            task_type: task_type.into(),
            input_schema,
            output_schema,
            cacheable: false,
            execute,
        }
    }

    /// Mark the handler cacheable
    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnTaskHandler<F>
where
    F: Fn(Value, TaskContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value>> + Send,
{
    fn task_type(&self) -> &str {
        &self.task_type
    }

    fn input_schema(&self) -> ObjectSchema {
        self.input_schema.clone()
    }

    fn output_schema(&self) -> ObjectSchema {
        self.output_schema.clone()
    }

    fn cacheable(&self) -> bool {
        self.cacheable
    }

    async fn execute(&self, input: Value, ctx: TaskContext) -> Result<Value> {
        (self.execute)(input, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::PortSchema;
    use serde_json::json;

    fn upper_handler() -> Arc<dyn TaskHandler> {
        Arc::new(FnTaskHandler::new(
            "upper",
            ObjectSchema::new().with_port("text", PortSchema::text()),
            ObjectSchema::new().with_port("text", PortSchema::text()),
            |input, _ctx| async move {
                let text = input["text"].as_str().unwrap_or_default().to_uppercase();
                Ok(json!({ "text": text }))
            },
        ))
    }

    #[test]
    fn status_machine_allows_spec_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Disabled));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Aborting));
        assert!(Aborting.can_transition_to(Failed));

        assert!(!Completed.can_transition_to(Processing));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Aborting.can_transition_to(Completed));
    }

    #[test]
    fn progress_is_monotonic_within_a_run() {
        let task = Task::new(upper_handler(), TaskConfig::default());
        task.begin_run(json!({"text": "x"})).unwrap();
        task.report_progress(40.0, None, None);
        task.report_progress(10.0, None, None);
        assert_eq!(task.progress(), 40.0);

        task.complete(json!({"text": "X"})).unwrap();
        assert_eq!(task.progress(), 100.0);

        // Reset for re-run zeroes progress again.
        task.reset();
        task.begin_run(json!({"text": "y"})).unwrap();
        assert_eq!(task.progress(), 0.0);
    }

    #[test]
    fn event_sequence_for_successful_run() {
        let task = Arc::new(Task::new(upper_handler(), TaskConfig::default()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            task.events().on(move |event| {
                let tag = match event {
                    TaskEvent::Start => "start",
                    TaskEvent::Progress { .. } => "progress",
                    TaskEvent::Complete { .. } => "complete",
                    _ => "other",
                };
                seen.lock().push(tag);
            });
        }
        task.begin_run(json!({})).unwrap();
        task.report_progress(50.0, Some("halfway".into()), None);
        task.complete(json!({})).unwrap();
        assert_eq!(*seen.lock(), vec!["start", "progress", "complete"]);
    }

    #[test]
    fn run_output_only_trusted_when_completed() {
        let task = Task::new(upper_handler(), TaskConfig::default());
        assert!(task.run_output().is_none());
        task.begin_run(json!({})).unwrap();
        assert!(task.run_output().is_none());
        task.complete(json!({"text": "OK"})).unwrap();
        assert_eq!(task.run_output(), Some(json!({"text": "OK"})));
    }

    #[test]
    fn restore_maps_in_flight_statuses_to_pending() {
        let task = Task::new(upper_handler(), TaskConfig::default());
        task.restore_state(TaskStatus::Processing, None, None, 30.0, None);
        assert_eq!(task.status(), TaskStatus::Pending);

        task.restore_state(
            TaskStatus::Completed,
            Some(json!({})),
            Some(json!({"text": "A"})),
            100.0,
            None,
        );
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.run_output(), Some(json!({"text": "A"})));
    }

    #[test]
    fn registry_rejects_duplicates_and_unknowns() {
        let registry = TaskRegistry::new();
        registry.register(upper_handler()).unwrap();
        assert!(registry.register(upper_handler()).is_err());
        assert!(registry.get("upper").is_ok());
        assert!(matches!(
            registry.get("missing").unwrap_err(),
            TaskGraphError::Configuration(_)
        ));
        assert_eq!(registry.types(), vec!["upper".to_string()]);
    }

    #[test]
    fn default_merge_concatenates_replicated_ports() {
        let schema = ObjectSchema::new()
            .with_port("result", PortSchema::number().replicated())
            .with_port("label", PortSchema::text());
        let children = vec![
            json!({"result": 10, "label": "first"}),
            json!({"result": 20, "label": "second"}),
        ];
        let merged = default_merge(&schema, &children);
        assert_eq!(merged, json!({"result": [10, 20], "label": "first"}));
    }
}
