//! Integration tests for complete workflow runs
//!
//! These exercise the engine end to end: linear pipelines, replication
//! fan-out, streaming with accumulation, cancellation, caching, and reactive
//! recomputation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use taskgraph_core::{
    FnTaskHandler, ObjectSchema, PortSchema, PortType, Result, RunnerConfig, ServiceContainer,
    StreamEvent, StreamMode, TaskConfig, TaskContext, TaskEventStream, TaskGraphError,
    TaskHandler, TaskOutputCache, TaskRegistry, TaskStatus, Workflow, WorkflowEvent,
};
use taskgraph_storage::InMemoryTable;

fn services() -> ServiceContainer {
    ServiceContainer::new(TaskRegistry::new())
}

fn echo_handler() -> Arc<dyn TaskHandler> {
    Arc::new(FnTaskHandler::new(
        "echo",
        ObjectSchema::new().with_port("text", PortSchema::text().with_default(json!("hello"))),
        ObjectSchema::new().with_port("text", PortSchema::text()),
        |input, _ctx| async move { Ok(json!({"text": input["text"]})) },
    ))
}

fn upper_handler() -> Arc<dyn TaskHandler> {
    Arc::new(FnTaskHandler::new(
        "upper",
        ObjectSchema::new().with_port("text", PortSchema::text()),
        ObjectSchema::new().with_port("text", PortSchema::text()),
        |input, _ctx| async move {
            let text = input["text"].as_str().unwrap_or_default().to_uppercase();
            Ok(json!({"text": text}))
        },
    ))
}

/// Scenario: linear pipeline, non-streaming
#[tokio::test]
async fn linear_pipeline_uppercases() {
    let workflow = Workflow::new(services());
    workflow
        .add_task(echo_handler(), TaskConfig::with_id("a"))
        .unwrap();
    workflow
        .then(upper_handler(), TaskConfig::with_id("b"))
        .unwrap();

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        workflow.events().on(move |event| {
            let tag = match event {
                WorkflowEvent::Start => "start".to_string(),
                WorkflowEvent::TaskStart { task_id } => format!("task_start:{task_id}"),
                WorkflowEvent::TaskComplete { task_id, .. } => format!("task_complete:{task_id}"),
                WorkflowEvent::Complete { .. } => "complete".to_string(),
                _ => return,
            };
            seen.lock().push(tag);
        });
    }

    let output = workflow.run(None).await.unwrap();
    assert_eq!(output, json!({"text": "HELLO"}));
    assert_eq!(
        workflow.graph().task("b").unwrap().run_output(),
        Some(json!({"text": "HELLO"}))
    );

    let order = seen.lock().clone();
    let position = |tag: &str| order.iter().position(|t| t == tag).unwrap();
    // A completes before B starts; B starts before B completes.
    assert!(position("task_complete:a") < position("task_start:b"));
    assert!(position("task_start:b") < position("task_complete:b"));
    assert_eq!(order.first().map(String::as_str), Some("start"));
    assert_eq!(order.last().map(String::as_str), Some("complete"));
}

/// Scenario: fan-out via replication with Cartesian merge
#[tokio::test]
async fn replication_fans_out_and_merges() {
    let handler = Arc::new(FnTaskHandler::new(
        "mul",
        ObjectSchema::new()
            .with_port("a", PortSchema::number().replicated())
            .with_port("b", PortSchema::number()),
        ObjectSchema::new().with_port("result", PortSchema::number().replicated()),
        |input, _ctx| async move {
            let a = input["a"].as_f64().unwrap_or(0.0);
            let b = input["b"].as_f64().unwrap_or(0.0);
            Ok(json!({"result": a * b}))
        },
    ));

    let workflow = Workflow::new(services());
    workflow
        .add_task(handler, TaskConfig::with_id("m"))
        .unwrap();

    let output = workflow
        .run(Some(json!({"a": [1, 2, 3], "b": 10})))
        .await
        .unwrap();
    assert_eq!(output, json!({"result": [10.0, 20.0, 30.0]}));

    let task = workflow.graph().task("m").unwrap();
    let sub = task.sub_graph().expect("array mode builds a sub-graph");
    assert_eq!(sub.task_count(), 3);
    for index in 0..3 {
        let child = sub.task(&format!("m[{index}]")).unwrap();
        assert_eq!(child.status(), TaskStatus::Completed);
        assert_eq!(child.parent_task_id().as_deref(), Some("m"));
    }
}

/// Empty replicated input produces empty output plus a warning event
#[tokio::test]
async fn empty_replication_warns_and_completes() {
    let handler = Arc::new(FnTaskHandler::new(
        "mul",
        ObjectSchema::new().with_port("a", PortSchema::number().replicated()),
        ObjectSchema::new().with_port("result", PortSchema::number().replicated()),
        |input, _ctx| async move { Ok(json!({"result": input["a"]})) },
    ));
    let workflow = Workflow::new(services());
    workflow
        .add_task(handler, TaskConfig::with_id("m"))
        .unwrap();

    let warnings = Arc::new(AtomicUsize::new(0));
    {
        let warnings = Arc::clone(&warnings);
        workflow.events().on(move |event| {
            if matches!(event, WorkflowEvent::Warning { .. }) {
                warnings.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    let output = workflow.run(Some(json!({"a": []}))).await.unwrap();
    assert_eq!(output, json!({"result": []}));
    assert_eq!(warnings.load(Ordering::SeqCst), 1);
}

struct StreamingSource;

#[async_trait]
impl TaskHandler for StreamingSource {
    fn task_type(&self) -> &str {
        "stream_source"
    }

    fn input_schema(&self) -> ObjectSchema {
        ObjectSchema::new()
    }

    fn output_schema(&self) -> ObjectSchema {
        ObjectSchema::new().with_port("text", PortSchema::text().streaming(StreamMode::Append))
    }

    fn streamable(&self) -> bool {
        true
    }

    async fn execute(&self, _input: Value, _ctx: TaskContext) -> Result<Value> {
        Ok(json!({"text": "alpha"}))
    }

    fn execute_stream(&self, _input: Value, _ctx: TaskContext) -> Result<TaskEventStream> {
        let events = vec![
            Ok(StreamEvent::TextDelta {
                text_delta: "alp".to_string(),
            }),
            Ok(StreamEvent::TextDelta {
                text_delta: "ha".to_string(),
            }),
            Ok(StreamEvent::Finish {
                data: json!({"text": "alpha"}),
            }),
        ];
        Ok(Box::pin(futures::stream::iter(events)))
    }
}

/// Scenario: streaming source into a non-streaming sink accumulates
#[tokio::test]
async fn streaming_with_accumulation() {
    let workflow = Workflow::new(services());
    workflow
        .add_task(Arc::new(StreamingSource), TaskConfig::with_id("src"))
        .unwrap();
    workflow
        .then(upper_handler(), TaskConfig::with_id("sink"))
        .unwrap();

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        workflow.events().on(move |event| {
            match event {
                WorkflowEvent::StreamStart { task_id } => {
                    seen.lock().push(format!("stream_start:{task_id}"))
                }
                WorkflowEvent::StreamChunk { task_id, event } => {
                    if let StreamEvent::TextDelta { text_delta } = event {
                        seen.lock().push(format!("chunk:{task_id}:{text_delta}"))
                    }
                }
                WorkflowEvent::StreamEnd { task_id, output } => {
                    seen.lock().push(format!("stream_end:{task_id}:{output}"))
                }
                _ => {}
            };
        });
    }

    let output = workflow.run(None).await.unwrap();
    // The sink received the materialized full value.
    assert_eq!(output, json!({"text": "ALPHA"}));

    let order = seen.lock().clone();
    assert_eq!(
        order,
        vec![
            "stream_start:src".to_string(),
            "chunk:src:alp".to_string(),
            "chunk:src:ha".to_string(),
            format!("stream_end:src:{}", json!({"text": "alpha"})),
        ]
    );
}

fn sleeper_handler(label: &str) -> Arc<dyn TaskHandler> {
    Arc::new(FnTaskHandler::new(
        label,
        ObjectSchema::new(),
        ObjectSchema::new().with_port("done", PortSchema::of(PortType::Boolean)),
        |_input, ctx: TaskContext| async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(500)) => Ok(json!({"done": true})),
                _ = ctx.token().cancelled() => Err(TaskGraphError::Cancelled {
                    task: Some(ctx.task_id().to_string()),
                }),
            }
        },
    ))
}

/// Scenario: cancellation mid-run reaches every task promptly
#[tokio::test]
async fn cancellation_mid_run_fails_all_tasks() {
    let workflow = Arc::new(Workflow::new(services()));
    for id in ["s1", "s2", "s3"] {
        workflow
            .add_task(sleeper_handler(id), TaskConfig::with_id(id))
            .unwrap();
    }

    let runner = Arc::clone(&workflow);
    let handle = tokio::spawn(async move { runner.run(None).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let cancelled_at = Instant::now();
    workflow.cancel();

    let result = handle.await.unwrap();
    let settle_time = cancelled_at.elapsed();
    assert!(result.is_err());
    assert!(result.unwrap_err().is_cancellation());
    assert!(
        settle_time < Duration::from_millis(200),
        "settled in {settle_time:?}"
    );

    for id in ["s1", "s2", "s3"] {
        let task = workflow.graph().task(id).unwrap();
        assert_eq!(task.status(), TaskStatus::Failed);
        assert!(task.error().unwrap().contains("cancelled"));
    }
}

/// Scenario: cache singleflight across concurrent identical runs
#[tokio::test]
async fn cache_singleflight_executes_once() {
    let executions = Arc::new(AtomicUsize::new(0));
    let handler = {
        let executions = Arc::clone(&executions);
        Arc::new(
            FnTaskHandler::new(
                "expensive",
                ObjectSchema::new().with_port("n", PortSchema::number()),
                ObjectSchema::new().with_port("n", PortSchema::number()),
                move |input, _ctx| {
                    let executions = Arc::clone(&executions);
                    async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok(json!({"n": input["n"]}))
                    }
                },
            )
            .cacheable(),
        )
    };

    let cache = Arc::new(TaskOutputCache::new(Arc::new(InMemoryTable::new(
        TaskOutputCache::schema(),
    ))));
    let services = ServiceContainer::new(TaskRegistry::new()).with_cache(cache);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let workflow = Workflow::new(services.clone());
        workflow
            .add_task(Arc::clone(&handler) as Arc<dyn TaskHandler>, TaskConfig::default())
            .unwrap();
        handles.push(tokio::spawn(async move {
            workflow.run(Some(json!({"n": 7}))).await.unwrap()
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap(), json!({"n": 7}));
    }
    assert_eq!(executions.load(Ordering::SeqCst), 1);
}

/// continue_on_error keeps independent peers running
#[tokio::test]
async fn continue_on_error_runs_independent_peers() {
    let failing = Arc::new(FnTaskHandler::new(
        "failing",
        ObjectSchema::new(),
        ObjectSchema::new().with_port("x", PortSchema::number()),
        |_input, _ctx| async move {
            Err::<Value, _>(TaskGraphError::task_failure("bad", "failing", "boom", None))
        },
    ));

    let workflow = Workflow::new(services()).with_runner_config(RunnerConfig {
        continue_on_error: true,
        ..RunnerConfig::default()
    });
    workflow
        .add_task(failing, TaskConfig::with_id("bad"))
        .unwrap();
    workflow
        .add_task(echo_handler(), TaskConfig::with_id("ok"))
        .unwrap();

    let output = workflow.run(None).await.unwrap();
    assert_eq!(output, json!({"text": "hello"}));
    assert_eq!(
        workflow.graph().task("bad").unwrap().status(),
        TaskStatus::Failed
    );
    assert_eq!(
        workflow.graph().task("ok").unwrap().status(),
        TaskStatus::Completed
    );
}

/// Without continue_on_error the first failure cancels siblings
#[tokio::test]
async fn first_failure_cancels_siblings() {
    let failing = Arc::new(FnTaskHandler::new(
        "failing",
        ObjectSchema::new(),
        ObjectSchema::new().with_port("x", PortSchema::number()),
        |_input, _ctx| async move {
            Err::<Value, _>(TaskGraphError::task_failure("bad", "failing", "boom", None))
        },
    ));

    let workflow = Workflow::new(services());
    workflow
        .add_task(failing, TaskConfig::with_id("bad"))
        .unwrap();
    workflow
        .add_task(sleeper_handler("slow"), TaskConfig::with_id("slow"))
        .unwrap();

    let err = workflow.run(None).await.unwrap_err();
    assert!(err.to_string().contains("boom"));
    assert_eq!(
        workflow.graph().task("slow").unwrap().status(),
        TaskStatus::Failed
    );
}

struct ReactiveEcho;

#[async_trait]
impl TaskHandler for ReactiveEcho {
    fn task_type(&self) -> &str {
        "reactive_echo"
    }

    fn input_schema(&self) -> ObjectSchema {
        ObjectSchema::new().with_port("text", PortSchema::text().with_default(json!("hello")))
    }

    fn output_schema(&self) -> ObjectSchema {
        ObjectSchema::new().with_port("text", PortSchema::text())
    }

    fn reactive_safe(&self) -> bool {
        true
    }

    async fn execute(&self, input: Value, _ctx: TaskContext) -> Result<Value> {
        Ok(json!({"text": input["text"]}))
    }

    async fn execute_reactive(
        &self,
        input: Value,
        _prior_output: Option<Value>,
        _ctx: TaskContext,
    ) -> Result<Value> {
        Ok(json!({"text": input["text"]}))
    }
}

struct ReactiveUpper;

#[async_trait]
impl TaskHandler for ReactiveUpper {
    fn task_type(&self) -> &str {
        "reactive_upper"
    }

    fn input_schema(&self) -> ObjectSchema {
        ObjectSchema::new().with_port("text", PortSchema::text())
    }

    fn output_schema(&self) -> ObjectSchema {
        ObjectSchema::new().with_port("text", PortSchema::text())
    }

    fn reactive_safe(&self) -> bool {
        true
    }

    async fn execute(&self, input: Value, _ctx: TaskContext) -> Result<Value> {
        let text = input["text"].as_str().unwrap_or_default().to_uppercase();
        Ok(json!({"text": text}))
    }

    async fn execute_reactive(
        &self,
        input: Value,
        _prior_output: Option<Value>,
        _ctx: TaskContext,
    ) -> Result<Value> {
        let text = input["text"].as_str().unwrap_or_default().to_uppercase();
        Ok(json!({"text": text}))
    }
}

/// Reactive pass recomputes downstream without a full re-run
#[tokio::test]
async fn set_input_triggers_reactive_recomputation() {
    let workflow = Workflow::new(services());
    workflow
        .add_task(Arc::new(ReactiveEcho), TaskConfig::with_id("source"))
        .unwrap();
    workflow
        .then(Arc::new(ReactiveUpper), TaskConfig::with_id("upper"))
        .unwrap();

    let output = workflow.run(None).await.unwrap();
    assert_eq!(output, json!({"text": "HELLO"}));

    let updated = workflow
        .set_input("source", "text", json!("world"))
        .await
        .unwrap();
    assert!(updated.contains(&"source".to_string()));
    assert!(updated.contains(&"upper".to_string()));

    let upper = workflow.graph().task("upper").unwrap();
    // Status never advances past the prior completion; only the output moves.
    assert_eq!(upper.status(), TaskStatus::Completed);
    assert_eq!(upper.run_output(), Some(json!({"text": "WORLD"})));
}

/// Checkpoint round-trip: a completed graph replays as a no-op
#[tokio::test]
async fn resumed_completed_graph_is_noop() {
    use taskgraph_checkpoint::{CheckpointSaver, InMemoryCheckpointSaver};
    use taskgraph_core::CheckpointOptions;

    let executions = Arc::new(AtomicUsize::new(0));
    let counting = {
        let executions = Arc::clone(&executions);
        Arc::new(FnTaskHandler::new(
            "counting_echo",
            ObjectSchema::new().with_port("text", PortSchema::text().with_default(json!("hello"))),
            ObjectSchema::new().with_port("text", PortSchema::text()),
            move |input, _ctx| {
                let executions = Arc::clone(&executions);
                async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"text": input["text"]}))
                }
            },
        ))
    };

    let registry = TaskRegistry::new();
    registry.register(counting).unwrap();
    let saver: Arc<dyn CheckpointSaver> = Arc::new(InMemoryCheckpointSaver::new());
    let services = ServiceContainer::new(registry).with_checkpoints(Arc::clone(&saver));

    let workflow = Workflow::new(services.clone());
    workflow
        .add_task_type("counting_echo", TaskConfig::with_id("source"))
        .unwrap();
    workflow.run(None).await.unwrap();
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    let data = workflow
        .checkpoint("thread-1", CheckpointOptions::default())
        .await
        .unwrap();

    let resumed = Workflow::resume(services, &data).unwrap();
    assert_eq!(
        resumed.graph().task("source").unwrap().status(),
        TaskStatus::Completed
    );

    // Replaying the terminal checkpoint re-executes nothing.
    let output = resumed.run(None).await.unwrap();
    assert_eq!(output, json!({"text": "hello"}));
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    // An explicit reset re-runs.
    resumed.reset();
    resumed.run(None).await.unwrap();
    assert_eq!(executions.load(Ordering::SeqCst), 2);
}
