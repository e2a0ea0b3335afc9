//! Snapshots: serialize a graph's structure and runtime state for checkpoints
//!
//! A checkpoint splits into three documents (compressed independently by the
//! checkpoint crate): the graph topology, per-task runtime state, and
//! per-dataflow delivered values. Restoration reconstructs the graph from a
//! [`TaskRegistry`] - handlers are never serialized, only their type strings -
//! then replays statuses, outputs, and progress. Tasks that were in flight
//! resume from `PENDING`; sub-graphs are derived state and are regenerated
//! from inputs on the next run rather than persisted.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use taskgraph_checkpoint::{CheckpointBuilder, CheckpointData, CheckpointSaver};

use crate::error::{Result, TaskGraphError};
use crate::graph::TaskGraph;
use crate::task::{Task, TaskConfig, TaskRegistry, TaskStatus};

/// Provenance recorded on edges whose values were restored from a checkpoint
const RESTORED_RUN: u64 = 0;

/// Serialize the graph topology (tasks + dataflows as declared)
pub fn snapshot_graph(graph: &TaskGraph) -> Result<Value> {
    let mut tasks: Vec<Value> = Vec::new();
    for task in graph.tasks() {
        tasks.push(json!({
            "id": task.id(),
            "task_type": task.task_type(),
            "config": serde_json::to_value(task.config())?,
            "parent_task_id": task.parent_task_id(),
        }));
    }
    tasks.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));

    let mut dataflows: Vec<Value> = Vec::new();
    for edge in graph.dataflows() {
        dataflows.push(json!({
            "source_task_id": edge.source_task_id(),
            "source_port": edge.source_port(),
            "target_task_id": edge.target_task_id(),
            "target_port": edge.target_port(),
        }));
    }
    dataflows.sort_by(|a, b| a.to_string().cmp(&b.to_string()));

    Ok(json!({
        "id": graph.id(),
        "tasks": tasks,
        "dataflows": dataflows,
    }))
}

/// Serialize per-task runtime state
pub fn snapshot_task_states(graph: &TaskGraph) -> Result<Value> {
    let mut states = Map::new();
    for task in graph.tasks() {
        states.insert(
            task.id().to_string(),
            json!({
                "status": serde_json::to_value(task.status())?,
                "run_input": task.run_input(),
                "run_output": task.run_output(),
                "progress": task.progress(),
                "error": task.error(),
            }),
        );
    }
    Ok(Value::Object(states))
}

/// Serialize per-dataflow delivered values
pub fn snapshot_dataflow_states(graph: &TaskGraph) -> Value {
    let mut states = Map::new();
    for edge in graph.dataflows() {
        states.insert(
            edge.id().to_string(),
            json!({ "value": edge.value() }),
        );
    }
    Value::Object(states)
}

/// Options for [`save_checkpoint`]
#[derive(Debug, Clone, Default)]
pub struct CheckpointOptions {
    /// Previous checkpoint in the thread
    pub parent_checkpoint_id: Option<String>,
    /// Iteration correlation for looping composite tasks
    pub iteration_parent_task_id: Option<String>,
}

/// Snapshot `graph` and persist it through `saver`
pub async fn save_checkpoint(
    graph: &TaskGraph,
    saver: &Arc<dyn CheckpointSaver>,
    thread_id: &str,
    options: CheckpointOptions,
) -> Result<CheckpointData> {
    let mut builder = CheckpointBuilder::new(thread_id)
        .graph(&snapshot_graph(graph)?)?
        .task_states(&snapshot_task_states(graph)?)?
        .dataflow_states(&snapshot_dataflow_states(graph))?;
    if let Some(parent) = options.parent_checkpoint_id {
        builder = builder.parent(parent);
    }
    if let Some(iteration) = options.iteration_parent_task_id {
        builder = builder.iteration_parent(iteration);
    }
    let data = builder.build();
    saver.save(data.clone()).await?;
    Ok(data)
}

/// Reconstruct a graph from a checkpoint, replaying runtime state
pub fn restore_graph(data: &CheckpointData, registry: &TaskRegistry) -> Result<Arc<TaskGraph>> {
    let topology = data.graph.to_json()?;
    let task_states = data.task_states.to_json()?;
    let dataflow_states = data.dataflow_states.to_json()?;

    let graph_id = topology
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| TaskGraphError::Fatal("checkpoint topology missing graph id".into()))?;
    let graph = Arc::new(TaskGraph::with_id(graph_id));

    for entry in topology
        .get("tasks")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let task_type = entry
            .get("task_type")
            .and_then(Value::as_str)
            .ok_or_else(|| TaskGraphError::Fatal("checkpoint task missing type".into()))?;
        let handler = registry.get(task_type)?;
        let config: TaskConfig =
            serde_json::from_value(entry.get("config").cloned().unwrap_or(Value::Null))
                .unwrap_or_default();
        let task = Task::new(handler, config);
        if let Some(parent) = entry.get("parent_task_id").and_then(Value::as_str) {
            task.set_parent_task_id(parent);
        }
        graph.add_task(task)?;
    }

    for entry in topology
        .get("dataflows")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let field = |name: &str| -> Result<&str> {
            entry.get(name).and_then(Value::as_str).ok_or_else(|| {
                TaskGraphError::Fatal(format!("checkpoint dataflow missing '{name}'"))
            })
        };
        graph.add_dataflow(
            field("source_task_id")?,
            field("source_port")?,
            field("target_task_id")?,
            field("target_port")?,
        )?;
    }

    if let Some(states) = task_states.as_object() {
        for (task_id, state) in states {
            let Some(task) = graph.task(task_id) else {
                continue;
            };
            let status: TaskStatus =
                serde_json::from_value(state.get("status").cloned().unwrap_or(Value::Null))
                    .unwrap_or(TaskStatus::Pending);
            let progress = state
                .get("progress")
                .and_then(Value::as_f64)
                .unwrap_or(0.0) as f32;
            let error = state
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string);
            let non_null = |name: &str| {
                state
                    .get(name)
                    .filter(|value| !value.is_null())
                    .cloned()
            };
            task.restore_state(status, non_null("run_input"), non_null("run_output"), progress, error);
        }
    }

    if let Some(states) = dataflow_states.as_object() {
        for (edge_id, state) in states {
            let Some(edge) = graph.dataflow(edge_id) else {
                continue;
            };
            if let Some(value) = state.get("value").filter(|value| !value.is_null()) {
                edge.deliver(value.clone(), RESTORED_RUN);
            }
        }
    }

    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ObjectSchema, PortSchema};
    use crate::task::FnTaskHandler;
    use serde_json::json;
    use taskgraph_checkpoint::InMemoryCheckpointSaver;

    fn registry() -> TaskRegistry {
        let registry = TaskRegistry::new();
        registry
            .register(Arc::new(FnTaskHandler::new(
                "echo",
                ObjectSchema::new().with_port("text", PortSchema::text().optional()),
                ObjectSchema::new().with_port("text", PortSchema::text()),
                |input, _ctx| async move { Ok(json!({"text": input["text"]})) },
            )))
            .unwrap();
        registry
    }

    fn sample_graph(registry: &TaskRegistry) -> Arc<TaskGraph> {
        let graph = Arc::new(TaskGraph::with_id("g1"));
        for id in ["a", "b"] {
            let task = Task::new(registry.get("echo").unwrap(), TaskConfig::with_id(id));
            graph.add_task(task).unwrap();
        }
        graph.add_dataflow("a", "text", "b", "text").unwrap();
        graph
    }

    #[tokio::test]
    async fn save_then_restore_is_state_identical() {
        let registry = registry();
        let graph = sample_graph(&registry);

        // Put the graph into a mid-run-looking state.
        let a = graph.task("a").unwrap();
        a.begin_run(json!({"text": "hi"})).unwrap();
        a.complete(json!({"text": "hi"})).unwrap();
        graph.dataflow("a.text->b.text").unwrap().deliver(json!("hi"), 1);

        let saver: Arc<dyn CheckpointSaver> = Arc::new(InMemoryCheckpointSaver::new());
        let data = save_checkpoint(&graph, &saver, "thread-1", CheckpointOptions::default())
            .await
            .unwrap();

        let loaded = saver.get(&data.checkpoint_id).await.unwrap().unwrap();
        let restored = restore_graph(&loaded, &registry).unwrap();

        assert_eq!(
            snapshot_graph(&restored).unwrap(),
            snapshot_graph(&graph).unwrap()
        );
        assert_eq!(
            snapshot_task_states(&restored).unwrap(),
            snapshot_task_states(&graph).unwrap()
        );
        assert_eq!(
            snapshot_dataflow_states(&restored),
            snapshot_dataflow_states(&graph)
        );
    }

    #[tokio::test]
    async fn in_flight_tasks_resume_from_pending() {
        let registry = registry();
        let graph = sample_graph(&registry);
        graph
            .task("a")
            .unwrap()
            .begin_run(json!({"text": "x"}))
            .unwrap();

        let saver: Arc<dyn CheckpointSaver> = Arc::new(InMemoryCheckpointSaver::new());
        let data = save_checkpoint(&graph, &saver, "t", CheckpointOptions::default())
            .await
            .unwrap();
        let restored = restore_graph(&data, &registry).unwrap();
        assert_eq!(restored.task("a").unwrap().status(), TaskStatus::Pending);
    }
}
