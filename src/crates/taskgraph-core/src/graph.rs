//! Task graph: nodes, dataflow edges, adjacency, and change events
//!
//! A [`TaskGraph`] owns a set of [`Task`]s and the [`Dataflow`] edges between
//! their ports. The graph enforces the structural invariants the runners rely
//! on:
//!
//! - Edges are unique per `(source, source_port, target, target_port)`
//! - A target port has at most one inbound edge
//! - The edge-induced graph is acyclic (cycle-creating adds are rejected and
//!   leave the graph unchanged)
//!
//! Adjacency lookups (`source_tasks`, `target_tasks`, `source_dataflows`,
//! `target_dataflows`) are O(1) map reads. Every mutation emits a
//! [`GraphEvent`], which the reactive runner and UI consumers subscribe to.
//!
//! Iterative control flow (loops, map-reduce) is *not* expressed as graph
//! cycles; composite tasks regenerate their sub-graphs per iteration instead.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, TaskGraphError};
use crate::events::EventBus;
use crate::task::Task;

/// Change notifications emitted by a [`TaskGraph`]
#[derive(Debug, Clone)]
pub enum GraphEvent {
    /// A task was added
    TaskAdded {
        /// Id of the added task
        task_id: String,
    },
    /// A task (and its attached edges) was removed
    TaskRemoved {
        /// Id of the removed task
        task_id: String,
    },
    /// A task was replaced in place
    TaskReplaced {
        /// Id of the replaced task
        task_id: String,
    },
    /// A dataflow edge was added
    DataflowAdded {
        /// Id of the added edge
        dataflow_id: String,
    },
    /// A dataflow edge was removed
    DataflowRemoved {
        /// Id of the removed edge
        dataflow_id: String,
    },
}

struct DataflowState {
    /// Value delivered for the current run, when terminal
    value: Option<Value>,
    /// Whether a stream has started flowing across this edge
    stream_started: bool,
    /// Which run delivered `value` (reactive updates are idempotent per run)
    provenance: Option<u64>,
}

/// A directed edge `(source_task, source_port) -> (target_task, target_port)`
///
/// Carries one value per port per run; during streaming runs it additionally
/// tracks whether the stream has started.
pub struct Dataflow {
    id: String,
    source_task_id: String,
    source_port: String,
    target_task_id: String,
    target_port: String,
    state: RwLock<DataflowState>,
}

impl Dataflow {
    fn new(
        source_task_id: impl Into<String>,
        source_port: impl Into<String>,
        target_task_id: impl Into<String>,
        target_port: impl Into<String>,
    ) -> Self {
        let source_task_id = source_task_id.into();
        let source_port = source_port.into();
        let target_task_id = target_task_id.into();
        let target_port = target_port.into();
        Self {
            id: format!("{source_task_id}.{source_port}->{target_task_id}.{target_port}"),
            source_task_id,
            source_port,
            target_task_id,
            target_port,
            state: RwLock::new(DataflowState {
                value: None,
                stream_started: false,
                provenance: None,
            }),
        }
    }

    /// Edge id (`src.port->tgt.port`)
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Producing task
    pub fn source_task_id(&self) -> &str {
        &self.source_task_id
    }

    /// Producing port
    pub fn source_port(&self) -> &str {
        &self.source_port
    }

    /// Consuming task
    pub fn target_task_id(&self) -> &str {
        &self.target_task_id
    }

    /// Consuming port
    pub fn target_port(&self) -> &str {
        &self.target_port
    }

    /// The delivered value, when terminal
    pub fn value(&self) -> Option<Value> {
        self.state.read().value.clone()
    }

    /// Whether a terminal value has been delivered
    pub fn has_value(&self) -> bool {
        self.state.read().value.is_some()
    }

    /// Whether a stream has started flowing across this edge
    pub fn stream_started(&self) -> bool {
        self.state.read().stream_started
    }

    /// Deliver the terminal value for a run
    pub fn deliver(&self, value: Value, run: u64) {
        let mut state = self.state.write();
        state.value = Some(value);
        state.provenance = Some(run);
    }

    /// Run that delivered the current value
    pub fn provenance(&self) -> Option<u64> {
        self.state.read().provenance
    }

    /// Mark the stream as started for this run
    pub fn mark_stream_started(&self) {
        self.state.write().stream_started = true;
    }

    /// Clear delivery state (new run)
    pub fn reset(&self) {
        let mut state = self.state.write();
        state.value = None;
        state.stream_started = false;
        state.provenance = None;
    }
}

impl fmt::Debug for Dataflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataflow")
            .field("id", &self.id)
            .field("has_value", &self.has_value())
            .finish()
    }
}

#[derive(Default)]
struct GraphInner {
    tasks: HashMap<String, Arc<Task>>,
    dataflows: HashMap<String, Arc<Dataflow>>,
    /// task id -> outgoing dataflow ids
    outbound: HashMap<String, Vec<String>>,
    /// task id -> incoming dataflow ids
    inbound: HashMap<String, Vec<String>>,
}

/// The DAG of tasks and dataflows
///
/// Interior-mutable and shareable via `Arc`; mutations take a short write
/// lock and emit change events after it is released.
pub struct TaskGraph {
    id: String,
    inner: RwLock<GraphInner>,
    events: EventBus<GraphEvent>,
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskGraph {
    /// An empty graph with a generated id
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    /// An empty graph with an explicit id
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            inner: RwLock::new(GraphInner::default()),
            events: EventBus::new(),
        }
    }

    /// Graph id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Change-event bus
    pub fn events(&self) -> &EventBus<GraphEvent> {
        &self.events
    }

    /// Add a task; rejects duplicate ids
    pub fn add_task(&self, task: Task) -> Result<Arc<Task>> {
        let task = Arc::new(task);
        {
            let mut inner = self.inner.write();
            if inner.tasks.contains_key(task.id()) {
                return Err(TaskGraphError::configuration(format!(
                    "task id '{}' already exists in graph '{}'",
                    task.id(),
                    self.id
                )));
            }
            inner.tasks.insert(task.id().to_string(), Arc::clone(&task));
        }
        self.events.emit(GraphEvent::TaskAdded {
            task_id: task.id().to_string(),
        });
        Ok(task)
    }

    /// Remove a task and every edge touching it
    pub fn remove_task(&self, task_id: &str) -> Result<()> {
        let removed_edges = {
            let mut inner = self.inner.write();
            if inner.tasks.remove(task_id).is_none() {
                return Err(TaskGraphError::configuration(format!(
                    "task '{task_id}' not found in graph '{}'",
                    self.id
                )));
            }
            let mut attached: Vec<String> = Vec::new();
            attached.extend(inner.inbound.remove(task_id).unwrap_or_default());
            attached.extend(inner.outbound.remove(task_id).unwrap_or_default());
            for edge_id in &attached {
                if let Some(edge) = inner.dataflows.remove(edge_id) {
                    Self::detach(&mut inner, &edge);
                }
            }
            attached
        };
        for dataflow_id in removed_edges {
            self.events.emit(GraphEvent::DataflowRemoved { dataflow_id });
        }
        self.events.emit(GraphEvent::TaskRemoved {
            task_id: task_id.to_string(),
        });
        Ok(())
    }

    /// Replace a task in place, keeping its edges
    ///
    /// The replacement must carry the same id and declare every port its
    /// attached edges use.
    pub fn replace_task(&self, task: Task) -> Result<Arc<Task>> {
        let task = Arc::new(task);
        {
            let mut inner = self.inner.write();
            if !inner.tasks.contains_key(task.id()) {
                return Err(TaskGraphError::configuration(format!(
                    "cannot replace unknown task '{}'",
                    task.id()
                )));
            }
            for edge_id in inner.inbound.get(task.id()).into_iter().flatten() {
                let edge = &inner.dataflows[edge_id];
                if !task.input_schema().has_port(edge.target_port()) {
                    return Err(TaskGraphError::configuration(format!(
                        "replacement for '{}' drops input port '{}' used by edge '{}'",
                        task.id(),
                        edge.target_port(),
                        edge.id()
                    )));
                }
            }
            for edge_id in inner.outbound.get(task.id()).into_iter().flatten() {
                let edge = &inner.dataflows[edge_id];
                if !task.output_schema().has_port(edge.source_port()) {
                    return Err(TaskGraphError::configuration(format!(
                        "replacement for '{}' drops output port '{}' used by edge '{}'",
                        task.id(),
                        edge.source_port(),
                        edge.id()
                    )));
                }
            }
            inner.tasks.insert(task.id().to_string(), Arc::clone(&task));
        }
        self.events.emit(GraphEvent::TaskReplaced {
            task_id: task.id().to_string(),
        });
        Ok(task)
    }

    /// Look up one task
    pub fn task(&self, task_id: &str) -> Option<Arc<Task>> {
        self.inner.read().tasks.get(task_id).cloned()
    }

    /// All tasks (unordered)
    pub fn tasks(&self) -> Vec<Arc<Task>> {
        self.inner.read().tasks.values().cloned().collect()
    }

    /// Number of tasks
    pub fn task_count(&self) -> usize {
        self.inner.read().tasks.len()
    }

    /// Look up one dataflow by id
    pub fn dataflow(&self, dataflow_id: &str) -> Option<Arc<Dataflow>> {
        self.inner.read().dataflows.get(dataflow_id).cloned()
    }

    /// All dataflows (unordered)
    pub fn dataflows(&self) -> Vec<Arc<Dataflow>> {
        self.inner.read().dataflows.values().cloned().collect()
    }

    /// Connect `(source, source_port)` to `(target, target_port)`
    ///
    /// Validates that both tasks exist, the ports are declared, the target
    /// port is unbound, and the edge keeps the graph acyclic. On any failure
    /// the graph is unchanged.
    pub fn add_dataflow(
        &self,
        source_task_id: &str,
        source_port: &str,
        target_task_id: &str,
        target_port: &str,
    ) -> Result<Arc<Dataflow>> {
        let edge = Arc::new(Dataflow::new(
            source_task_id,
            source_port,
            target_task_id,
            target_port,
        ));
        {
            let mut inner = self.inner.write();
            let source = inner.tasks.get(source_task_id).ok_or_else(|| {
                TaskGraphError::configuration(format!("source task '{source_task_id}' not found"))
            })?;
            let target = inner.tasks.get(target_task_id).ok_or_else(|| {
                TaskGraphError::configuration(format!("target task '{target_task_id}' not found"))
            })?;
            if !source.output_schema().has_port(source_port) {
                return Err(TaskGraphError::configuration(format!(
                    "task '{source_task_id}' has no output port '{source_port}'"
                )));
            }
            if !target.input_schema().has_port(target_port) {
                return Err(TaskGraphError::configuration(format!(
                    "task '{target_task_id}' has no input port '{target_port}'"
                )));
            }
            if inner.dataflows.contains_key(edge.id()) {
                return Err(TaskGraphError::configuration(format!(
                    "dataflow '{}' already exists",
                    edge.id()
                )));
            }
            let bound = inner
                .inbound
                .get(target_task_id)
                .into_iter()
                .flatten()
                .any(|existing| inner.dataflows[existing].target_port() == target_port);
            if bound {
                return Err(TaskGraphError::configuration(format!(
                    "input port '{target_port}' of task '{target_task_id}' already has an inbound dataflow"
                )));
            }
            if source_task_id == target_task_id
                || Self::reaches(&inner, target_task_id, source_task_id)
            {
                return Err(TaskGraphError::configuration(format!(
                    "dataflow {source_task_id} -> {target_task_id} would create a cycle"
                )));
            }

            inner
                .dataflows
                .insert(edge.id().to_string(), Arc::clone(&edge));
            inner
                .outbound
                .entry(source_task_id.to_string())
                .or_default()
                .push(edge.id().to_string());
            inner
                .inbound
                .entry(target_task_id.to_string())
                .or_default()
                .push(edge.id().to_string());
        }
        self.events.emit(GraphEvent::DataflowAdded {
            dataflow_id: edge.id().to_string(),
        });
        Ok(edge)
    }

    /// Remove one dataflow
    pub fn remove_dataflow(&self, dataflow_id: &str) -> Result<()> {
        {
            let mut inner = self.inner.write();
            let edge = inner.dataflows.remove(dataflow_id).ok_or_else(|| {
                TaskGraphError::configuration(format!("dataflow '{dataflow_id}' not found"))
            })?;
            Self::detach(&mut inner, &edge);
        }
        self.events.emit(GraphEvent::DataflowRemoved {
            dataflow_id: dataflow_id.to_string(),
        });
        Ok(())
    }

    fn detach(inner: &mut GraphInner, edge: &Dataflow) {
        if let Some(out) = inner.outbound.get_mut(edge.source_task_id()) {
            out.retain(|id| id != edge.id());
        }
        if let Some(inbound) = inner.inbound.get_mut(edge.target_task_id()) {
            inbound.retain(|id| id != edge.id());
        }
    }

    /// Whether `to` is reachable from `from` along dataflow edges
    fn reaches(inner: &GraphInner, from: &str, to: &str) -> bool {
        let mut stack = vec![from.to_string()];
        let mut visited = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            for edge_id in inner.outbound.get(&current).into_iter().flatten() {
                stack.push(inner.dataflows[edge_id].target_task_id().to_string());
            }
        }
        false
    }

    /// Edges feeding `task_id` (its inputs)
    pub fn source_dataflows(&self, task_id: &str) -> Vec<Arc<Dataflow>> {
        let inner = self.inner.read();
        inner
            .inbound
            .get(task_id)
            .into_iter()
            .flatten()
            .map(|id| Arc::clone(&inner.dataflows[id]))
            .collect()
    }

    /// Edges leaving `task_id` (its outputs)
    pub fn target_dataflows(&self, task_id: &str) -> Vec<Arc<Dataflow>> {
        let inner = self.inner.read();
        inner
            .outbound
            .get(task_id)
            .into_iter()
            .flatten()
            .map(|id| Arc::clone(&inner.dataflows[id]))
            .collect()
    }

    /// Tasks producing inputs for `task_id`
    pub fn source_tasks(&self, task_id: &str) -> Vec<Arc<Task>> {
        let inner = self.inner.read();
        let mut seen = HashSet::new();
        inner
            .inbound
            .get(task_id)
            .into_iter()
            .flatten()
            .filter_map(|id| {
                let source = inner.dataflows[id].source_task_id();
                seen.insert(source.to_string())
                    .then(|| inner.tasks.get(source).cloned())
                    .flatten()
            })
            .collect()
    }

    /// Tasks consuming outputs of `task_id`
    pub fn target_tasks(&self, task_id: &str) -> Vec<Arc<Task>> {
        let inner = self.inner.read();
        let mut seen = HashSet::new();
        inner
            .outbound
            .get(task_id)
            .into_iter()
            .flatten()
            .filter_map(|id| {
                let target = inner.dataflows[id].target_task_id();
                seen.insert(target.to_string())
                    .then(|| inner.tasks.get(target).cloned())
                    .flatten()
            })
            .collect()
    }

    /// Tasks with no inbound edges, sorted by id for determinism
    pub fn roots(&self) -> Vec<Arc<Task>> {
        let inner = self.inner.read();
        let mut roots: Vec<Arc<Task>> = inner
            .tasks
            .values()
            .filter(|task| {
                inner
                    .inbound
                    .get(task.id())
                    .map(|edges| edges.is_empty())
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        roots.sort_by(|a, b| a.id().cmp(b.id()));
        roots
    }

    /// Tasks with no outbound edges, sorted by id for determinism
    pub fn leaves(&self) -> Vec<Arc<Task>> {
        let inner = self.inner.read();
        let mut leaves: Vec<Arc<Task>> = inner
            .tasks
            .values()
            .filter(|task| {
                inner
                    .outbound
                    .get(task.id())
                    .map(|edges| edges.is_empty())
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        leaves.sort_by(|a, b| a.id().cmp(b.id()));
        leaves
    }

    /// Task ids in a topological order (Kahn's algorithm)
    ///
    /// Ties are broken by id so the order is deterministic. Errors with
    /// [`TaskGraphError::Fatal`] if a cycle is present, which `add_dataflow`
    /// makes unreachable in practice.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let inner = self.inner.read();
        let mut in_degree: HashMap<&str, usize> = inner
            .tasks
            .keys()
            .map(|id| {
                (
                    id.as_str(),
                    inner.inbound.get(id).map(Vec::len).unwrap_or(0),
                )
            })
            .collect();

        let mut queue: VecDeque<&str> = {
            let mut zero: Vec<&str> = in_degree
                .iter()
                .filter(|(_, degree)| **degree == 0)
                .map(|(id, _)| *id)
                .collect();
            zero.sort();
            zero.into()
        };

        let mut order = Vec::with_capacity(inner.tasks.len());
        while let Some(current) = queue.pop_front() {
            order.push(current.to_string());
            let mut unblocked: Vec<&str> = Vec::new();
            for edge_id in inner.outbound.get(current).into_iter().flatten() {
                let target = inner.dataflows[edge_id].target_task_id();
                if let Some(degree) = in_degree.get_mut(target) {
                    *degree -= 1;
                    if *degree == 0 {
                        unblocked.push(target);
                    }
                }
            }
            unblocked.sort();
            queue.extend(unblocked);
        }

        if order.len() != inner.tasks.len() {
            return Err(TaskGraphError::Fatal(format!(
                "graph '{}' contains a cycle",
                self.id
            )));
        }
        Ok(order)
    }

    /// Clear delivery state of every edge and reset terminal tasks (new run)
    pub fn reset_run_state(&self) {
        let inner = self.inner.read();
        for edge in inner.dataflows.values() {
            edge.reset();
        }
        for task in inner.tasks.values() {
            if task.status().is_terminal() && task.status() != crate::task::TaskStatus::Disabled {
                task.reset();
            }
        }
    }
}

impl fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("TaskGraph")
            .field("id", &self.id)
            .field("tasks", &inner.tasks.len())
            .field("dataflows", &inner.dataflows.len())
            .finish()
    }
}
