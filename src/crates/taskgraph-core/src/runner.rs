//! Graph runner: data-dependency scheduling, streaming propagation, cancellation
//!
//! The [`GraphRunner`] executes a [`TaskGraph`] by repeatedly scheduling every
//! READY task, bounded by an optional concurrency cap. A task is READY when it
//! is `PENDING` and each inbound edge has either delivered its terminal value
//! (non-streaming, and streaming edges that require accumulation) or started
//! streaming (pass-through streaming edges).
//!
//! # Streaming
//!
//! A streamable task whose output schema declares a streaming port runs
//! through `execute_stream`. The runner consumes the chunk sequence once and
//! fans it out:
//!
//! - pass-through edges (same stream mode on both ports) get a bounded
//!   channel the target reads live via
//!   [`TaskContext::take_input_stream`](crate::task::TaskContext::take_input_stream);
//!   the edge is marked started, which makes the target READY immediately;
//! - accumulating edges fold chunks into a materialized value that is
//!   delivered - and unblocks the target - only at `finish`.
//!
//! # Cancellation
//!
//! The runner holds a root [`CancellationToken`]. Cancelling it stops further
//! scheduling, signals every in-flight task through its child token, and moves
//! lingering tasks `PROCESSING -> ABORTING -> FAILED`; tasks that ignore the
//! signal past the grace period are forcibly failed.
//!
//! # Failure policy
//!
//! Without `continue_on_error`, the first task failure cancels the siblings
//! and surfaces as the run's error. With it, the failed task is marked and
//! peers whose inputs do not depend on it keep running.
//!
//! # Cleanup
//!
//! Each run owns a [`CleanupRegistry`]. Callbacks registered during the run
//! (deduplicated by key) execute exactly once when the run ends, on success,
//! failure, and abort alike.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::error::{Result, TaskGraphError};
use crate::graph::{Dataflow, TaskGraph};
use crate::replicate;
use crate::runtime::ServiceContainer;
use crate::schema::{edge_needs_accumulation, output_stream_mode, validate_input, StreamMode};
use crate::stream::{stream_channel, StreamAccumulator, StreamEvent, StreamReceiver};
use crate::task::{Task, TaskContext, TaskStatus};

/// Upper bound used when no concurrency cap is configured
const UNBOUNDED_CONCURRENCY: usize = 1024;

/// Runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum tasks executing concurrently (unbounded when `None`)
    pub concurrency: Option<usize>,
    /// Keep running peers after a task failure
    pub continue_on_error: bool,
    /// How long aborting tasks may take to wind down before being failed
    pub abort_grace: Duration,
    /// Overall run deadline; expiry cancels the run
    pub run_timeout: Option<Duration>,
    /// Bound of per-edge stream channels
    pub stream_capacity: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            continue_on_error: false,
            abort_grace: Duration::from_secs(30),
            run_timeout: None,
            stream_capacity: crate::stream::DEFAULT_STREAM_CAPACITY,
        }
    }
}

type CleanupFn = Box<dyn FnOnce() + Send>;

/// Run-scoped cleanup callbacks, deduplicated by key
///
/// Callbacks run exactly once when the owning run ends; registrations after
/// that point are invoked immediately.
#[derive(Clone, Default)]
pub struct CleanupRegistry {
    inner: Arc<Mutex<Option<HashMap<String, CleanupFn>>>>,
}

impl CleanupRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(HashMap::new()))),
        }
    }

    /// Register a callback under `key`; later registrations with the same key
    /// are dropped
    pub fn register(&self, key: impl Into<String>, callback: impl FnOnce() + Send + 'static) {
        let key = key.into();
        let late = {
            let mut slot = self.inner.lock();
            match slot.as_mut() {
                Some(entries) => {
                    entries.entry(key).or_insert_with(|| Box::new(callback));
                    None
                }
                // The run already ended; honor the callback now.
                None => Some(callback),
            }
        };
        if let Some(callback) = late {
            callback();
        }
    }

    /// Invoke every callback once, in key order, and seal the registry
    pub fn run_all(&self) {
        let entries = self.inner.lock().take();
        if let Some(entries) = entries {
            let mut ordered: Vec<(String, CleanupFn)> = entries.into_iter().collect();
            ordered.sort_by(|a, b| a.0.cmp(&b.0));
            for (key, callback) in ordered {
                trace!(%key, "running cleanup callback");
                callback();
            }
        }
    }
}

/// Executes task graphs
pub struct GraphRunner {
    services: ServiceContainer,
    config: RunnerConfig,
    run_counter: AtomicU64,
}

impl GraphRunner {
    /// A runner with default configuration
    pub fn new(services: ServiceContainer) -> Self {
        Self {
            services,
            config: RunnerConfig::default(),
            run_counter: AtomicU64::new(1),
        }
    }

    /// Override the configuration
    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// The active configuration
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Execute `graph`, binding `input` to its root tasks
    ///
    /// Only `PENDING` tasks run; tasks already `COMPLETED` (a resumed
    /// checkpoint, a partial previous run) keep their outputs, which are
    /// re-delivered to their edges so dependents become ready. Replaying a
    /// fully completed graph is therefore a no-op that returns the merged
    /// leaf outputs. Use [`TaskGraph::reset_run_state`] for a fresh re-run.
    ///
    /// `token` is the run's root cancellation signal; cancelling it aborts
    /// the run.
    #[instrument(skip_all, fields(graph_id = %graph.id()))]
    pub async fn run(
        &self,
        graph: &Arc<TaskGraph>,
        input: Option<Value>,
        token: CancellationToken,
    ) -> Result<Value> {
        let run_id = self.run_counter.fetch_add(1, Ordering::Relaxed);
        for task in graph.tasks() {
            if task.status() == TaskStatus::Completed {
                if let Some(output) = task.run_output() {
                    deliver_outputs(graph, &task, &output, run_id);
                }
            }
        }

        let cleanup = CleanupRegistry::new();
        let result = self
            .run_inner(graph, input, token, run_id, cleanup.clone())
            .await;
        cleanup.run_all();
        result
    }

    async fn run_inner(
        &self,
        graph: &Arc<TaskGraph>,
        input: Option<Value>,
        token: CancellationToken,
        run_id: u64,
        cleanup: CleanupRegistry,
    ) -> Result<Value> {
        let semaphore = Arc::new(Semaphore::new(
            self.config.concurrency.unwrap_or(UNBOUNDED_CONCURRENCY).max(1),
        ));
        let pending_streams: PendingStreams = Arc::new(Mutex::new(HashMap::new()));
        // Mid-run readiness changes (a stream starting) wake the scheduler
        // without waiting for a task to finish.
        let wake = Arc::new(tokio::sync::Notify::new());
        let deadline = self.config.run_timeout.map(|t| tokio::time::Instant::now() + t);

        let mut join_set: JoinSet<(String, Result<()>)> = JoinSet::new();
        let mut running: HashSet<String> = HashSet::new();
        let mut first_error: Option<TaskGraphError> = None;
        let mut aborted = false;

        loop {
            if !token.is_cancelled() {
                for task in ready_tasks(graph, &running) {
                    match self.resolve_input(graph, &task, input.as_ref()) {
                        Ok(resolved) => {
                            running.insert(task.id().to_string());
                            let run = SingleRun {
                                graph: Arc::clone(graph),
                                task: Arc::clone(&task),
                                services: self.services.clone(),
                                config: self.config.clone(),
                                cleanup: cleanup.clone(),
                                semaphore: Arc::clone(&semaphore),
                                pending_streams: Arc::clone(&pending_streams),
                                wake: Arc::clone(&wake),
                                token: token.child_token(),
                                run_id,
                            };
                            join_set.spawn(async move {
                                let id = run.task.id().to_string();
                                let outcome = run.execute(resolved).await;
                                (id, outcome)
                            });
                        }
                        Err(err) => {
                            // Input resolution failures are task failures, not
                            // scheduler crashes.
                            task.begin_run(Value::Null).ok();
                            task.fail(&err);
                            if first_error.is_none() {
                                first_error = Some(err);
                            }
                            if !self.config.continue_on_error {
                                token.cancel();
                            }
                        }
                    }
                }
            }

            if join_set.is_empty() {
                break;
            }

            tokio::select! {
                joined = join_set.join_next() => {
                    match joined {
                        Some(Ok((task_id, outcome))) => {
                            running.remove(&task_id);
                            if let Err(err) = outcome {
                                debug!(%task_id, error = %err, "task run failed");
                                if first_error.is_none() && !err.is_cancellation() {
                                    first_error = Some(err);
                                }
                                if !self.config.continue_on_error {
                                    token.cancel();
                                }
                            }
                        }
                        Some(Err(join_err)) => {
                            let err = TaskGraphError::Fatal(format!(
                                "task execution panicked: {join_err}"
                            ));
                            if first_error.is_none() {
                                first_error = Some(err);
                            }
                            token.cancel();
                        }
                        None => break,
                    }
                }
                _ = wake.notified() => {
                    // Loop back and re-evaluate readiness.
                }
                _ = token.cancelled(), if !aborted => {
                    aborted = true;
                    self.abort_in_flight(graph, &mut join_set, &mut running).await;
                    break;
                }
                _ = sleep_until_deadline(deadline), if deadline.is_some() && !aborted => {
                    warn!(graph_id = %graph.id(), "run timeout expired, cancelling");
                    token.cancel();
                }
            }
        }

        if token.is_cancelled() && !aborted {
            self.abort_in_flight(graph, &mut join_set, &mut running).await;
        }

        if token.is_cancelled() {
            return Err(first_error.unwrap_or(TaskGraphError::cancelled()));
        }
        if let Some(err) = first_error {
            if !self.config.continue_on_error {
                return Err(err);
            }
            if !graph
                .leaves()
                .iter()
                .any(|leaf| leaf.status() == TaskStatus::Completed)
            {
                return Err(err);
            }
        }

        Ok(merge_leaf_outputs(graph))
    }

    /// Abort path: signal, wait out the grace period, then force-fail stragglers
    async fn abort_in_flight(
        &self,
        graph: &Arc<TaskGraph>,
        join_set: &mut JoinSet<(String, Result<()>)>,
        running: &mut HashSet<String>,
    ) {
        for task_id in running.iter() {
            if let Some(task) = graph.task(task_id) {
                task.begin_abort();
            }
        }

        let grace = self.config.abort_grace;
        let drain = async {
            while let Some(joined) = join_set.join_next().await {
                if let Ok((task_id, _)) = joined {
                    running.remove(&task_id);
                }
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!(graph_id = %graph.id(), "abort grace period expired, forcing failure");
            join_set.abort_all();
            while join_set.join_next().await.is_some() {}
        }

        // Whatever did not reach a terminal state on its own is failed here.
        for task_id in running.drain() {
            if let Some(task) = graph.task(&task_id) {
                if !task.status().is_terminal() {
                    task.fail(&TaskGraphError::Cancelled {
                        task: Some(task_id.clone()),
                    });
                }
            }
        }
    }

    /// Build a task's effective input from its inbound edges and the run input
    fn resolve_input(
        &self,
        graph: &Arc<TaskGraph>,
        task: &Arc<Task>,
        run_input: Option<&Value>,
    ) -> Result<Value> {
        let inbound = graph.source_dataflows(task.id());
        let mut provided = Map::new();
        let mut stream_fed: HashSet<String> = HashSet::new();

        if inbound.is_empty() {
            // Root task: the run input binds directly.
            if let Some(Value::Object(map)) = run_input {
                provided = map.clone();
            }
        }
        for edge in &inbound {
            if let Some(value) = edge.value() {
                provided.insert(edge.target_port().to_string(), value);
            } else if edge.stream_started() {
                stream_fed.insert(edge.target_port().to_string());
            }
        }

        // Ports fed by a live stream validate as optional and absent; the
        // task reads them through its attached input stream instead.
        let mut schema = task.input_schema();
        for port_name in &stream_fed {
            if let Some(port) = schema.port(port_name) {
                let mut relaxed = port.clone();
                relaxed.required = false;
                schema = schema.with_port(port_name.clone(), relaxed);
            }
        }

        validate_input(task.id(), &schema, &Value::Object(provided))
    }
}

fn sleep_until_deadline(deadline: Option<tokio::time::Instant>) -> tokio::time::Sleep {
    tokio::time::sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now))
}

type PendingStreams = Arc<Mutex<HashMap<String, StreamReceiver>>>;

/// Tasks schedulable right now
fn ready_tasks(graph: &Arc<TaskGraph>, running: &HashSet<String>) -> Vec<Arc<Task>> {
    let mut ready: Vec<Arc<Task>> = graph
        .tasks()
        .into_iter()
        .filter(|task| task.status() == TaskStatus::Pending && !running.contains(task.id()))
        .filter(|task| {
            graph
                .source_dataflows(task.id())
                .iter()
                .all(|edge| edge_satisfied(graph, edge))
        })
        .collect();
    ready.sort_by(|a, b| a.id().cmp(b.id()));
    ready
}

/// Whether one inbound edge no longer blocks its target
fn edge_satisfied(graph: &Arc<TaskGraph>, edge: &Arc<Dataflow>) -> bool {
    if edge.has_value() {
        return true;
    }
    if !edge.stream_started() {
        return false;
    }
    // A started stream unblocks the target only on pass-through edges.
    let (Some(source), Some(target)) = (
        graph.task(edge.source_task_id()),
        graph.task(edge.target_task_id()),
    ) else {
        return false;
    };
    !edge_needs_accumulation(
        &source.output_schema(),
        edge.source_port(),
        &target.input_schema(),
        edge.target_port(),
    )
}

/// Merge the outputs of completed leaf tasks into the run result
fn merge_leaf_outputs(graph: &Arc<TaskGraph>) -> Value {
    let completed: Vec<(String, Value)> = graph
        .leaves()
        .iter()
        .filter(|leaf| leaf.status() == TaskStatus::Completed)
        .filter_map(|leaf| leaf.run_output().map(|output| (leaf.id().to_string(), output)))
        .collect();
    match completed.len() {
        0 => Value::Null,
        1 => completed.into_iter().next().map(|(_, output)| output).unwrap_or(Value::Null),
        _ => {
            let mut merged = Map::new();
            for (_, output) in completed {
                if let Value::Object(map) = output {
                    for (key, value) in map {
                        merged.insert(key, value);
                    }
                }
            }
            Value::Object(merged)
        }
    }
}

/// Everything one task run needs, bundled for the spawned future
struct SingleRun {
    graph: Arc<TaskGraph>,
    task: Arc<Task>,
    services: ServiceContainer,
    config: RunnerConfig,
    cleanup: CleanupRegistry,
    semaphore: Arc<Semaphore>,
    pending_streams: PendingStreams,
    wake: Arc<tokio::sync::Notify>,
    token: CancellationToken,
    run_id: u64,
}

impl SingleRun {
    async fn execute(self, input: Value) -> Result<()> {
        let permit = tokio::select! {
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map_err(|_| TaskGraphError::Fatal("runner semaphore closed".into()))?
            }
            _ = self.token.cancelled() => {
                return Err(TaskGraphError::Cancelled {
                    task: Some(self.task.id().to_string()),
                });
            }
        };

        if let Err(err) = self.task.begin_run(input.clone()) {
            // A task that cannot start must not stay PENDING, or the
            // scheduler would pick it up again.
            self.task.fail(&err);
            return Err(err);
        }

        let ctx = TaskContext::new(
            Arc::clone(&self.task),
            self.token.clone(),
            self.services.clone(),
        )
        .with_cleanup(self.cleanup.clone());

        // Hand the task any live streams its inbound edges started.
        for edge in self.graph.source_dataflows(self.task.id()) {
            let receiver = self.pending_streams.lock().remove(edge.id());
            if let Some(receiver) = receiver {
                ctx.attach_input_stream(edge.target_port().to_string(), receiver);
            }
        }

        let outcome = self.execute_body(&input, ctx, permit).await;
        match outcome {
            Ok(output) => {
                deliver_outputs(&self.graph, &self.task, &output, self.run_id);
                self.task.complete(output)?;
                Ok(())
            }
            Err(err) => {
                if err.is_cancellation() {
                    self.task.begin_abort();
                }
                self.task.fail(&err);
                Err(err)
            }
        }
    }

    async fn execute_body(
        &self,
        input: &Value,
        ctx: TaskContext,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) -> Result<Value> {
        let handler = Arc::clone(self.task.handler());
        let input_schema = self.task.input_schema();

        if replicate::is_array_mode(&input_schema, input) {
            // Children take their own permits; holding the parent's would
            // deadlock a concurrency-1 runner.
            drop(permit);
            return self.execute_array(input, &ctx).await;
        }

        let streaming = handler.streamable()
            && output_stream_mode(&handler.output_schema()) != StreamMode::None;
        if streaming {
            return self.execute_streaming(input, ctx).await;
        }

        let _permit = permit;
        if handler.cacheable() {
            if let Some(cache) = self.services.cache().cloned() {
                let fingerprint =
                    crate::cache::TaskOutputCache::key(self.task.task_type(), input);
                let owned_input = input.clone();
                let retry_ctx = ctx.clone();
                return cache
                    .get_or_execute(&fingerprint, self.task.task_type(), || async move {
                        self.execute_with_retry(&owned_input, retry_ctx).await
                    })
                    .await;
            }
        }
        self.execute_with_retry(input, ctx).await
    }

    /// Authoritative execute with the task's retry policy applied to
    /// transient failures
    async fn execute_with_retry(&self, input: &Value, ctx: TaskContext) -> Result<Value> {
        let policy = &self.task.config().retry;
        let handler = Arc::clone(self.task.handler());
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            ctx.check_cancelled()?;
            let result = handler.execute(input.clone(), ctx.clone()).await;
            match result {
                Ok(output) => return Ok(output),
                Err(err) => {
                    let retryable = err.is_transient()
                        || (matches!(err, TaskGraphError::Timeout { .. })
                            && policy.retry_on_timeout);
                    if !retryable || !policy.should_retry(attempt) {
                        return Err(err);
                    }
                    let delay = policy.delay_for_attempt(attempt + 1);
                    debug!(
                        task_id = %self.task.id(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after transient failure"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.token.cancelled() => {
                            return Err(TaskGraphError::Cancelled {
                                task: Some(self.task.id().to_string()),
                            });
                        }
                    }
                }
            }
        }
    }

    /// Streaming path: consume the chunk sequence once, fan it out per edge
    async fn execute_streaming(&self, input: &Value, ctx: TaskContext) -> Result<Value> {
        let handler = Arc::clone(self.task.handler());
        let source_schema = handler.output_schema();
        let mut stream = handler.execute_stream(input.clone(), ctx.clone())?;

        // Classify outgoing edges once, before the first chunk.
        let mut passthrough = Vec::new();
        let mut accumulators: Vec<(Arc<Dataflow>, StreamAccumulator)> = Vec::new();
        for edge in self.graph.target_dataflows(self.task.id()) {
            let source_mode =
                crate::schema::port_stream_mode(&source_schema, edge.source_port());
            if source_mode == StreamMode::None {
                continue;
            }
            let Some(target) = self.graph.task(edge.target_task_id()) else {
                continue;
            };
            if edge_needs_accumulation(
                &source_schema,
                edge.source_port(),
                &target.input_schema(),
                edge.target_port(),
            ) {
                accumulators.push((Arc::clone(&edge), StreamAccumulator::new(source_mode)));
            } else {
                let (tx, rx) = stream_channel(self.config.stream_capacity);
                self.pending_streams
                    .lock()
                    .insert(edge.id().to_string(), rx);
                edge.mark_stream_started();
                passthrough.push((Arc::clone(&edge), tx));
            }
        }
        if !passthrough.is_empty() {
            // Pass-through targets became READY; get them scheduled while we
            // are still producing.
            self.wake.notify_one();
        }

        self.task.emit_stream_start();
        let mut final_output: Option<Value> = None;

        while let Some(event) = tokio::select! {
            event = stream.next() => event,
            _ = self.token.cancelled() => {
                return Err(TaskGraphError::Cancelled {
                    task: Some(self.task.id().to_string()),
                });
            }
        } {
            let event = event?;
            if !event.is_terminal() {
                // Terminal events surface as StreamEnd / task failure instead.
                self.task.emit_stream_chunk(event.clone());
            }

            for (_, tx) in &passthrough {
                // Consumer backpressure applies here; a dropped consumer reads
                // as cancellation of that edge only.
                let _ = tx.send(event.clone()).await;
            }
            for (_, accumulator) in accumulators.iter_mut() {
                accumulator.apply(&event);
            }

            match event {
                StreamEvent::Finish { data } => {
                    final_output = Some(data);
                    break;
                }
                StreamEvent::Error { error } => {
                    return Err(TaskGraphError::task_failure(
                        self.task.id(),
                        self.task.task_type(),
                        error,
                        Some(self.task.progress()),
                    ));
                }
                _ => {}
            }
        }

        let output = final_output.ok_or_else(|| {
            TaskGraphError::Fatal(format!(
                "task '{}' stream ended without a finish event",
                self.task.id()
            ))
        })?;

        // Deliver materialized values on accumulating edges; the aggregate
        // from `finish` wins when it covers the port.
        for (edge, accumulator) in accumulators {
            let value = output
                .get(edge.source_port())
                .cloned()
                .unwrap_or_else(|| accumulator.current());
            edge.deliver(value, self.run_id);
        }
        drop(passthrough);

        self.task.emit_stream_end(output.clone());
        Ok(output)
    }

    /// Array mode: run the expanded sub-graph and merge child outputs
    async fn execute_array(&self, input: &Value, ctx: &TaskContext) -> Result<Value> {
        let expansion = replicate::expand(&self.task, input)?;

        if expansion.is_empty() {
            self.task
                .emit_warning("replicated input is empty; producing empty output");
            return replicate::merge(&self.task, input, &[]);
        }

        let mut join_set: JoinSet<(usize, Result<Value>)> = JoinSet::new();
        for (index, (child_id, child_input)) in expansion
            .child_ids
            .iter()
            .zip(expansion.child_inputs.iter())
            .enumerate()
        {
            let child = expansion.graph.task(child_id).ok_or_else(|| {
                TaskGraphError::Fatal(format!("expansion child '{child_id}' missing"))
            })?;
            let child_input = child_input.clone();
            let services = self.services.clone();
            let semaphore = Arc::clone(&self.semaphore);
            let token = self.token.child_token();
            let cleanup = self.cleanup.clone();
            join_set.spawn(async move {
                let outcome = run_expansion_child(
                    child,
                    child_input,
                    services,
                    semaphore,
                    token,
                    cleanup,
                )
                .await;
                (index, outcome)
            });
        }

        let mut outputs: Vec<Option<Value>> = vec![None; expansion.len()];
        let mut failure: Option<TaskGraphError> = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, Ok(output))) => outputs[index] = Some(output),
                Ok((_, Err(err))) => {
                    if failure.is_none() {
                        failure = Some(err);
                        // One failed replica fails the whole task.
                        self.token.cancel();
                    }
                }
                Err(join_err) => {
                    if failure.is_none() {
                        failure =
                            Some(TaskGraphError::Fatal(format!("replica panicked: {join_err}")));
                        self.token.cancel();
                    }
                }
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }

        let ordered: Vec<Value> = outputs.into_iter().map(|o| o.unwrap_or(Value::Null)).collect();
        ctx.check_cancelled()?;
        replicate::merge(&self.task, input, &ordered)
    }
}

/// Run one array-mode child task to completion
async fn run_expansion_child(
    child: Arc<Task>,
    input: Value,
    services: ServiceContainer,
    semaphore: Arc<Semaphore>,
    token: CancellationToken,
    cleanup: CleanupRegistry,
) -> Result<Value> {
    let _permit = tokio::select! {
        permit = semaphore.acquire_owned() => {
            permit.map_err(|_| TaskGraphError::Fatal("runner semaphore closed".into()))?
        }
        _ = token.cancelled() => {
            return Err(TaskGraphError::Cancelled {
                task: Some(child.id().to_string()),
            });
        }
    };

    let schema = child.input_schema();
    let input = validate_input(child.id(), &schema, &input)?;
    child.begin_run(input.clone())?;
    let ctx = TaskContext::new(Arc::clone(&child), token.clone(), services)
        .with_cleanup(cleanup);
    match child.handler().execute(input, ctx).await {
        Ok(output) => {
            child.complete(output.clone())?;
            Ok(output)
        }
        Err(err) => {
            if err.is_cancellation() {
                child.begin_abort();
            }
            child.fail(&err);
            Err(err)
        }
    }
}

/// Write a completed task's output onto its outgoing edges
fn deliver_outputs(graph: &Arc<TaskGraph>, task: &Arc<Task>, output: &Value, run_id: u64) {
    for edge in graph.target_dataflows(task.id()) {
        let value = output.get(edge.source_port()).cloned().unwrap_or(Value::Null);
        edge.deliver(value, run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn cleanup_runs_each_key_exactly_once() {
        let registry = CleanupRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            registry.register("close-stream", move || {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let calls = Arc::clone(&calls);
            registry.register("release-lock", move || {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        registry.run_all();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Sealed: run_all is idempotent, late registrations fire immediately.
        registry.run_all();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        {
            let calls = Arc::clone(&calls);
            registry.register("late", move || {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
