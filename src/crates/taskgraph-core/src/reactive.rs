//! Reactive runner: cheap downstream recomputation on upstream change
//!
//! After an authoritative pass the graph retains every task's
//! `run_output_data`. When an upstream value changes - through a programmatic
//! [`set_input`] or a graph subscription - the reactive runner walks the
//! affected tasks in topological order and invokes `execute_reactive` on each,
//! updating outputs in place without re-running expensive `execute` paths.
//!
//! Rules (which also resolve the engine's open questions):
//!
//! - Only tasks already `COMPLETED` are recomputed; a reactive pass never
//!   advances a task's status past its prior completion.
//! - A task whose handler is not reactive-safe stops the walk; it and its
//!   downstream are marked *stale* and await a full execute.
//! - A `FAILED` task stops the walk the same way: `execute_reactive` is not
//!   invoked after a failed execute.
//! - Output replacement is atomic per task, and delivered edge values carry
//!   the reactive run's provenance so repeated walks are idempotent.
//! - In array mode, a change is recomputed elementwise when the replicated
//!   input shape is unchanged; otherwise the sub-graph is regenerated (the
//!   task emits `Regenerate`) and the task goes stale.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, instrument, trace};

use crate::error::{Result, TaskGraphError};
use crate::graph::TaskGraph;
use crate::replicate;
use crate::runtime::ServiceContainer;
use crate::schema::validate_input;
use crate::task::{Task, TaskContext, TaskStatus};
use tokio_util::sync::CancellationToken;

/// Reactive run ids share the provenance space with authoritative runs but
/// count from a high base so the two are distinguishable in traces.
const REACTIVE_RUN_BASE: u64 = 1 << 32;

/// Walks dependents of changed tasks, invoking `execute_reactive`
pub struct ReactiveRunner {
    services: ServiceContainer,
    run_counter: AtomicU64,
}

impl ReactiveRunner {
    /// A reactive runner using the given collaborators
    pub fn new(services: ServiceContainer) -> Self {
        Self {
            services,
            run_counter: AtomicU64::new(REACTIVE_RUN_BASE),
        }
    }

    /// Recompute everything downstream of `changed_task_id`
    ///
    /// Returns the ids of tasks whose outputs were updated, in walk order.
    #[instrument(skip_all, fields(graph_id = %graph.id(), changed = %changed_task_id))]
    pub async fn run(
        &self,
        graph: &Arc<TaskGraph>,
        changed_task_id: &str,
    ) -> Result<Vec<String>> {
        let changed = graph.task(changed_task_id).ok_or_else(|| {
            TaskGraphError::configuration(format!("task '{changed_task_id}' not found"))
        })?;

        let run_id = self.run_counter.fetch_add(1, Ordering::Relaxed);
        let order = graph.topological_order()?;
        let downstream = reachable_from(graph, changed_task_id);

        // The changed task's own (new) output must flow onto its edges first.
        if changed.status() == TaskStatus::Completed {
            if let Some(output) = changed.run_output() {
                deliver(graph, &changed, &output, run_id);
            }
        }

        let mut updated = Vec::new();
        let mut stale: HashSet<String> = HashSet::new();

        for task_id in order {
            if !downstream.contains(&task_id) || task_id == changed_task_id {
                continue;
            }
            let task = match graph.task(&task_id) {
                Some(task) => task,
                None => continue,
            };

            // Stale-ness propagates: anything fed by a stale task is stale.
            let upstream_stale = graph
                .source_tasks(&task_id)
                .iter()
                .any(|source| stale.contains(source.id()) || source.is_stale());
            if upstream_stale {
                mark_stale(&task, &mut stale);
                continue;
            }

            if task.status() == TaskStatus::Failed {
                trace!(%task_id, "skipping reactive update of failed task");
                mark_stale(&task, &mut stale);
                continue;
            }
            if task.status() != TaskStatus::Completed {
                // Never ran; a future authoritative pass will pick it up.
                continue;
            }
            if !task.handler().reactive_safe() {
                debug!(%task_id, "handler not reactive-safe; marking downstream stale");
                mark_stale(&task, &mut stale);
                continue;
            }

            let input = self.resolve_input(graph, &task)?;
            let output = self.recompute(graph, &task, input, run_id).await?;
            deliver(graph, &task, &output, run_id);
            task.set_run_output(output);
            updated.push(task_id);
        }

        Ok(updated)
    }

    /// Programmatically change one input port of a task, then walk downstream
    ///
    /// The task's recorded `run_input` is patched and the task itself is
    /// recomputed (when completed and reactive-safe) before its dependents.
    pub async fn set_input(
        &self,
        graph: &Arc<TaskGraph>,
        task_id: &str,
        port: &str,
        value: Value,
    ) -> Result<Vec<String>> {
        let task = graph.task(task_id).ok_or_else(|| {
            TaskGraphError::configuration(format!("task '{task_id}' not found"))
        })?;
        if !task.input_schema().has_port(port) {
            return Err(TaskGraphError::configuration(format!(
                "task '{task_id}' has no input port '{port}'"
            )));
        }

        let mut input = match task.run_input() {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        input.insert(port.to_string(), value);
        let input = Value::Object(input);
        // Later walks (and the next authoritative pass) see the patched input.
        task.set_run_input(input.clone());

        let run_id = self.run_counter.fetch_add(1, Ordering::Relaxed);
        if task.status() == TaskStatus::Completed && task.handler().reactive_safe() {
            let validated = validate_input(task.id(), &task.input_schema(), &input)?;
            let output = self.recompute(graph, &task, validated, run_id).await?;
            deliver(graph, &task, &output, run_id);
            task.set_run_output(output);
        } else {
            task.set_stale(true);
        }

        let mut updated = vec![task_id.to_string()];
        updated.extend(self.run(graph, task_id).await?);
        Ok(updated)
    }

    /// One reactive recomputation, handling array mode
    async fn recompute(
        &self,
        _graph: &Arc<TaskGraph>,
        task: &Arc<Task>,
        input: Value,
        _run_id: u64,
    ) -> Result<Value> {
        let ctx = TaskContext::new(
            Arc::clone(task),
            CancellationToken::new(),
            self.services.clone(),
        );
        let prior = task.run_output();
        let schema = task.input_schema();

        if replicate::is_array_mode(&schema, &input) {
            let child_inputs = replicate::expand_input(&schema, &input)?;
            let existing = task
                .sub_graph()
                .map(|sub| sub.task_count())
                .unwrap_or(0);
            if child_inputs.len() != existing {
                // Shape changed: regenerate the sub-graph and go stale; the
                // next authoritative pass runs the new children.
                replicate::expand(task, &input)?;
                task.set_stale(true);
                return Ok(prior.unwrap_or(Value::Null));
            }

            let sub = task.sub_graph().ok_or_else(|| {
                TaskGraphError::Fatal(format!("task '{}' lost its sub-graph", task.id()))
            })?;
            let mut child_outputs = Vec::with_capacity(child_inputs.len());
            for (index, child_input) in child_inputs.into_iter().enumerate() {
                let child_id = format!("{}[{}]", task.id(), index);
                let child = sub.task(&child_id).ok_or_else(|| {
                    TaskGraphError::Fatal(format!("expansion child '{child_id}' missing"))
                })?;
                let child_ctx = TaskContext::new(
                    Arc::clone(&child),
                    CancellationToken::new(),
                    self.services.clone(),
                );
                let child_prior = child.run_output();
                let output = child
                    .handler()
                    .execute_reactive(child_input, child_prior, child_ctx)
                    .await?;
                child.set_run_output(output.clone());
                child_outputs.push(output);
            }
            return replicate::merge(task, &input, &child_outputs);
        }

        task.handler().execute_reactive(input, prior, ctx).await
    }

    fn resolve_input(&self, graph: &Arc<TaskGraph>, task: &Arc<Task>) -> Result<Value> {
        let mut provided = match task.run_input() {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        for edge in graph.source_dataflows(task.id()) {
            if let Some(value) = edge.value() {
                provided.insert(edge.target_port().to_string(), value);
            }
        }
        validate_input(task.id(), &task.input_schema(), &Value::Object(provided))
    }
}

fn mark_stale(task: &Arc<Task>, stale: &mut HashSet<String>) {
    task.set_stale(true);
    stale.insert(task.id().to_string());
}

fn deliver(graph: &Arc<TaskGraph>, task: &Arc<Task>, output: &Value, run_id: u64) {
    for edge in graph.target_dataflows(task.id()) {
        // Idempotence: a walk that already delivered for this run skips the write.
        if edge.provenance() == Some(run_id) {
            continue;
        }
        let value = output.get(edge.source_port()).cloned().unwrap_or(Value::Null);
        edge.deliver(value, run_id);
    }
}

/// Task ids reachable from `start` along dataflow edges (excluding `start`)
fn reachable_from(graph: &Arc<TaskGraph>, start: &str) -> HashSet<String> {
    let mut visited = HashSet::new();
    let mut stack: Vec<String> = graph
        .target_tasks(start)
        .iter()
        .map(|t| t.id().to_string())
        .collect();
    while let Some(current) = stack.pop() {
        if !visited.insert(current.clone()) {
            continue;
        }
        for next in graph.target_tasks(&current) {
            stack.push(next.id().to_string());
        }
    }
    visited
}
