//! Workflow façade: graph building by chaining plus a consolidated event stream
//!
//! [`Workflow`] wraps a [`TaskGraph`], a [`GraphRunner`], and a
//! [`ReactiveRunner`] behind a builder-style API:
//!
//! ```rust,ignore
//! let workflow = Workflow::new(services);
//! workflow.add_task(source_handler, TaskConfig::with_id("source"))?;
//! workflow.then(uppercase_handler, TaskConfig::with_id("upper"))?; // auto-connects matching ports
//!
//! let sub = workflow.events().on(|event| println!("{event:?}"));
//! let output = workflow.run(Some(json!({"text": "hello"}))).await?;
//! ```
//!
//! Every task added through the façade has its task-level events re-emitted on
//! the workflow bus as [`WorkflowEvent`]s tagged with the task id, so one
//! subscription observes the whole run: `start`, per-task starts/progress,
//! stream chunks, completions, and the final `complete`/`error`.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use taskgraph_checkpoint::CheckpointData;

use crate::error::{Result, TaskGraphError};
use crate::events::{EventBus, EventSubscription};
use crate::graph::TaskGraph;
use crate::reactive::ReactiveRunner;
use crate::runner::{GraphRunner, RunnerConfig};
use crate::runtime::ServiceContainer;
use crate::snapshot::{self, CheckpointOptions};
use crate::stream::StreamEvent;
use crate::task::{Task, TaskConfig, TaskEvent, TaskHandler};

/// Consolidated event stream of a workflow run
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// The run began
    Start,
    /// A task began executing
    TaskStart {
        /// The task
        task_id: String,
    },
    /// A task reported progress
    Progress {
        /// The task
        task_id: String,
        /// Percentage in `[0, 100]`
        progress: f32,
        /// Optional message
        message: Option<String>,
        /// Optional structured details
        details: Option<Value>,
    },
    /// A task began streaming output
    StreamStart {
        /// The task
        task_id: String,
    },
    /// One streaming chunk
    StreamChunk {
        /// The task
        task_id: String,
        /// The chunk
        event: StreamEvent,
    },
    /// A task finished streaming
    StreamEnd {
        /// The task
        task_id: String,
        /// The materialized output
        output: Value,
    },
    /// A task completed
    TaskComplete {
        /// The task
        task_id: String,
        /// Its output
        output: Value,
    },
    /// A task failed
    TaskError {
        /// The task
        task_id: String,
        /// Failure message
        error: String,
    },
    /// A task observed cancellation
    TaskAbort {
        /// The task
        task_id: String,
    },
    /// Non-fatal advisory
    Warning {
        /// Task context, when applicable
        task_id: Option<String>,
        /// Advisory message
        message: String,
    },
    /// The run completed with the merged leaf output
    Complete {
        /// Merged output of leaf tasks
        output: Value,
    },
    /// The run failed
    Error {
        /// Failure message
        error: String,
    },
}

/// Builder and runtime wrapper around one task graph
pub struct Workflow {
    graph: Arc<TaskGraph>,
    services: ServiceContainer,
    runner: GraphRunner,
    reactive: ReactiveRunner,
    events: EventBus<WorkflowEvent>,
    last_task_id: Mutex<Option<String>>,
    forwards: Mutex<Vec<EventSubscription<TaskEvent>>>,
    current_token: Mutex<Option<CancellationToken>>,
}

impl Workflow {
    /// An empty workflow over a fresh graph
    pub fn new(services: ServiceContainer) -> Self {
        Self {
            graph: Arc::new(TaskGraph::new()),
            services: services.clone(),
            runner: GraphRunner::new(services.clone()),
            reactive: ReactiveRunner::new(services),
            events: EventBus::new(),
            last_task_id: Mutex::new(None),
            forwards: Mutex::new(Vec::new()),
            current_token: Mutex::new(None),
        }
    }

    /// Override the runner configuration
    pub fn with_runner_config(mut self, config: RunnerConfig) -> Self {
        self.runner = GraphRunner::new(self.services.clone()).with_config(config);
        self
    }

    /// The underlying graph
    pub fn graph(&self) -> &Arc<TaskGraph> {
        &self.graph
    }

    /// The consolidated event bus
    pub fn events(&self) -> &EventBus<WorkflowEvent> {
        &self.events
    }

    /// Add a task from a handler instance
    pub fn add_task(
        &self,
        handler: Arc<dyn TaskHandler>,
        config: TaskConfig,
    ) -> Result<Arc<Task>> {
        let task = self.graph.add_task(Task::new(handler, config))?;
        self.forward_events(&task);
        *self.last_task_id.lock() = Some(task.id().to_string());
        Ok(task)
    }

    /// Add a task by registered type string
    pub fn add_task_type(&self, task_type: &str, config: TaskConfig) -> Result<Arc<Task>> {
        let handler = self.services.registry().get(task_type)?;
        self.add_task(handler, config)
    }

    /// Connect two ports explicitly
    pub fn connect(
        &self,
        source_task_id: &str,
        source_port: &str,
        target_task_id: &str,
        target_port: &str,
    ) -> Result<()> {
        self.graph
            .add_dataflow(source_task_id, source_port, target_task_id, target_port)?;
        Ok(())
    }

    /// Add a task and auto-connect it after the previously added one
    ///
    /// Ports are matched by name: every output port of the previous task with
    /// a same-named input port on the new task gets an edge. Errors when
    /// nothing matches.
    pub fn then(&self, handler: Arc<dyn TaskHandler>, config: TaskConfig) -> Result<Arc<Task>> {
        let previous_id = self.last_task_id.lock().clone().ok_or_else(|| {
            TaskGraphError::configuration("then() requires a previously added task")
        })?;
        let previous = self.graph.task(&previous_id).ok_or_else(|| {
            TaskGraphError::configuration(format!("previous task '{previous_id}' missing"))
        })?;

        let task = self.add_task(handler, config)?;
        let source_schema = previous.output_schema();
        let target_schema = task.input_schema();
        let mut connected = 0usize;
        for (name, _) in source_schema.iter() {
            if target_schema.has_port(name) {
                self.graph
                    .add_dataflow(&previous_id, name, task.id(), name)?;
                connected += 1;
            }
        }
        if connected == 0 {
            return Err(TaskGraphError::configuration(format!(
                "no ports of '{previous_id}' match inputs of '{}'",
                task.id()
            )));
        }
        Ok(task)
    }

    /// Execute the graph, binding `input` to root tasks
    ///
    /// Emits `Start` before scheduling and exactly one of `Complete`/`Error`
    /// after the run settles; returns the merged output of leaf tasks.
    #[instrument(skip_all, fields(graph_id = %self.graph.id()))]
    pub async fn run(&self, input: Option<Value>) -> Result<Value> {
        let token = CancellationToken::new();
        *self.current_token.lock() = Some(token.clone());

        self.events.emit(WorkflowEvent::Start);
        let result = self.runner.run(&self.graph, input, token).await;
        *self.current_token.lock() = None;

        match &result {
            Ok(output) => self.events.emit(WorkflowEvent::Complete {
                output: output.clone(),
            }),
            Err(err) => self.events.emit(WorkflowEvent::Error {
                error: err.to_string(),
            }),
        }
        result
    }

    /// Cancel the in-flight run, if any
    pub fn cancel(&self) {
        if let Some(token) = self.current_token.lock().clone() {
            token.cancel();
        }
    }

    /// Clear run state (statuses, edge values) for a fresh re-run
    ///
    /// Without this, [`Workflow::run`] treats completed tasks as done and
    /// replays are no-ops.
    pub fn reset(&self) {
        self.graph.reset_run_state();
    }

    /// Reactive pass after an upstream change (see [`ReactiveRunner::run`])
    pub async fn run_reactive(&self, changed_task_id: &str) -> Result<Vec<String>> {
        self.reactive.run(&self.graph, changed_task_id).await
    }

    /// Programmatic input change + reactive pass
    pub async fn set_input(
        &self,
        task_id: &str,
        port: &str,
        value: Value,
    ) -> Result<Vec<String>> {
        self.reactive
            .set_input(&self.graph, task_id, port, value)
            .await
    }

    /// Snapshot the graph through the configured checkpoint saver
    pub async fn checkpoint(
        &self,
        thread_id: &str,
        options: CheckpointOptions,
    ) -> Result<CheckpointData> {
        let saver = self.services.checkpoints().cloned().ok_or_else(|| {
            TaskGraphError::configuration("no checkpoint saver configured")
        })?;
        snapshot::save_checkpoint(&self.graph, &saver, thread_id, options).await
    }

    /// Rebuild a workflow from a checkpoint
    pub fn resume(services: ServiceContainer, data: &CheckpointData) -> Result<Self> {
        let graph = snapshot::restore_graph(data, services.registry())?;
        let workflow = Self {
            graph,
            services: services.clone(),
            runner: GraphRunner::new(services.clone()),
            reactive: ReactiveRunner::new(services),
            events: EventBus::new(),
            last_task_id: Mutex::new(None),
            forwards: Mutex::new(Vec::new()),
            current_token: Mutex::new(None),
        };
        for task in workflow.graph.tasks() {
            workflow.forward_events(&task);
        }
        Ok(workflow)
    }

    /// Re-emit one task's events on the workflow bus, tagged with its id
    fn forward_events(&self, task: &Arc<Task>) {
        let task_id = task.id().to_string();
        let bus = self.events.clone();
        let subscription = task.events().on(move |event| {
            let forwarded = match event {
                TaskEvent::Start => WorkflowEvent::TaskStart {
                    task_id: task_id.clone(),
                },
                TaskEvent::Progress {
                    progress,
                    message,
                    details,
                } => WorkflowEvent::Progress {
                    task_id: task_id.clone(),
                    progress: *progress,
                    message: message.clone(),
                    details: details.clone(),
                },
                TaskEvent::StreamStart => WorkflowEvent::StreamStart {
                    task_id: task_id.clone(),
                },
                TaskEvent::StreamChunk { event } => WorkflowEvent::StreamChunk {
                    task_id: task_id.clone(),
                    event: event.clone(),
                },
                TaskEvent::StreamEnd { output } => WorkflowEvent::StreamEnd {
                    task_id: task_id.clone(),
                    output: output.clone(),
                },
                TaskEvent::Complete { output } => WorkflowEvent::TaskComplete {
                    task_id: task_id.clone(),
                    output: output.clone(),
                },
                TaskEvent::Error { error } => WorkflowEvent::TaskError {
                    task_id: task_id.clone(),
                    error: error.clone(),
                },
                TaskEvent::Abort => WorkflowEvent::TaskAbort {
                    task_id: task_id.clone(),
                },
                TaskEvent::Regenerate => WorkflowEvent::Warning {
                    task_id: Some(task_id.clone()),
                    message: "sub-graph regenerated after input change".to_string(),
                },
                TaskEvent::Warning { message } => WorkflowEvent::Warning {
                    task_id: Some(task_id.clone()),
                    message: message.clone(),
                },
            };
            bus.emit(forwarded);
        });
        self.forwards.lock().push(subscription);
    }
}
