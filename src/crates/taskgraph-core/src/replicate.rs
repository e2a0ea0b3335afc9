//! Array replication: fan a task out over array-valued replicated ports
//!
//! When an input port declared `replicate: true` receives an array, the task
//! enters *array mode*: it expands into a sub-graph with one child per element
//! of the Cartesian product of all replicated array inputs (non-replicated
//! inputs broadcast unchanged), runs the children, and merges their outputs
//! back through the handler's `execute_merge`.
//!
//! # Determinism
//!
//! Child order is lexicographic over `(port_name, index)`: replicated ports
//! are sorted by name, the first port is the most significant "digit", and
//! indexes count up within each port. Identical inputs therefore always
//! produce identical child order and merged output shape.
//!
//! # Edge cases
//!
//! - A replicated port holding a *scalar* does not trigger array mode for
//!   that port; it broadcasts like any other input.
//! - An empty replicated array expands to zero children; the merged output
//!   has empty arrays on replicated output ports and the runner emits a
//!   warning event rather than failing.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{Result, TaskGraphError};
use crate::graph::TaskGraph;
use crate::schema::ObjectSchema;
use crate::task::{Task, TaskConfig};

/// Replicated ports of `input` that actually hold arrays, sorted by name
pub fn array_ports(schema: &ObjectSchema, input: &Value) -> Vec<(String, Vec<Value>)> {
    let mut ports: Vec<(String, Vec<Value>)> = schema
        .replicated_ports()
        .into_iter()
        .filter_map(|name| {
            input
                .get(name)
                .and_then(Value::as_array)
                .map(|items| (name.to_string(), items.clone()))
        })
        .collect();
    ports.sort_by(|a, b| a.0.cmp(&b.0));
    ports
}

/// Whether `input` puts a task with `schema` into array mode
pub fn is_array_mode(schema: &ObjectSchema, input: &Value) -> bool {
    !array_ports(schema, input).is_empty()
}

/// Expand an array-mode input into per-child inputs, in deterministic order
///
/// Returns an empty vector when any replicated array is empty (the Cartesian
/// product is empty).
pub fn expand_input(schema: &ObjectSchema, input: &Value) -> Result<Vec<Value>> {
    let ports = array_ports(schema, input);
    if ports.is_empty() {
        return Err(TaskGraphError::configuration(
            "expand_input called without an array-mode input",
        ));
    }
    if ports.iter().any(|(_, items)| items.is_empty()) {
        return Ok(Vec::new());
    }

    let base = match input {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };

    // Odometer over the sorted ports; the last port varies fastest, so the
    // first (lexicographically smallest) port is the most significant digit.
    let mut indexes = vec![0usize; ports.len()];
    let mut children = Vec::new();
    loop {
        let mut child = base.clone();
        for ((name, items), &index) in ports.iter().zip(indexes.iter()) {
            child.insert(name.clone(), items[index].clone());
        }
        children.push(Value::Object(child));

        let mut position = ports.len();
        loop {
            if position == 0 {
                return Ok(children);
            }
            position -= 1;
            indexes[position] += 1;
            if indexes[position] < ports[position].1.len() {
                break;
            }
            indexes[position] = 0;
        }
    }
}

/// An expanded array-mode task: the sub-graph and its ordered children
pub struct ArrayExpansion {
    /// Sub-graph holding one child task per combination
    pub graph: Arc<TaskGraph>,
    /// Child task ids, in expansion order
    pub child_ids: Vec<String>,
    /// Child inputs, in expansion order
    pub child_inputs: Vec<Value>,
}

impl ArrayExpansion {
    /// Number of children
    pub fn len(&self) -> usize {
        self.child_ids.len()
    }

    /// Whether the expansion is empty (empty replicated input)
    pub fn is_empty(&self) -> bool {
        self.child_ids.is_empty()
    }
}

/// Build the sub-graph for an array-mode run of `parent`
///
/// Children share the parent's handler, carry deterministic ids
/// (`{parent}[k]`), and reference the parent by id. The sub-graph is installed
/// on the parent task (emitting `Regenerate` when one already existed).
pub fn expand(parent: &Arc<Task>, input: &Value) -> Result<ArrayExpansion> {
    let child_inputs = expand_input(&parent.input_schema(), input)?;
    let graph = Arc::new(TaskGraph::with_id(format!("{}:subgraph", parent.id())));
    let mut child_ids = Vec::with_capacity(child_inputs.len());

    for (index, _) in child_inputs.iter().enumerate() {
        let child_id = format!("{}[{}]", parent.id(), index);
        let child = Task::new(
            Arc::clone(parent.handler()),
            TaskConfig::with_id(child_id.clone()).named(parent.config().name.clone()),
        );
        child.set_parent_task_id(parent.id());
        graph.add_task(child)?;
        child_ids.push(child_id);
    }

    parent.set_sub_graph(Arc::clone(&graph));
    Ok(ArrayExpansion {
        graph,
        child_ids,
        child_inputs,
    })
}

/// Merge per-child outputs through the parent's `execute_merge`
pub fn merge(parent: &Arc<Task>, input: &Value, child_outputs: &[Value]) -> Result<Value> {
    parent.handler().execute_merge(input, child_outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{PortSchema, PortType};
    use crate::task::FnTaskHandler;
    use serde_json::json;

    fn fan_schema() -> ObjectSchema {
        ObjectSchema::new()
            .with_port("a", PortSchema::number().replicated())
            .with_port("b", PortSchema::number())
    }

    fn fan_task() -> Arc<Task> {
        let handler = Arc::new(FnTaskHandler::new(
            "mul",
            fan_schema(),
            ObjectSchema::new().with_port("result", PortSchema::number().replicated()),
            |input, _ctx| async move {
                let a = input["a"].as_f64().unwrap_or(0.0);
                let b = input["b"].as_f64().unwrap_or(0.0);
                Ok(json!({"result": a * b}))
            },
        ));
        Arc::new(Task::new(handler, TaskConfig::with_id("m")))
    }

    #[test]
    fn scalar_replicated_port_does_not_trigger_array_mode() {
        let schema = fan_schema();
        assert!(!is_array_mode(&schema, &json!({"a": 3, "b": 10})));
        assert!(is_array_mode(&schema, &json!({"a": [1, 2], "b": 10})));
    }

    #[test]
    fn expansion_broadcasts_scalars() {
        let schema = fan_schema();
        let children = expand_input(&schema, &json!({"a": [1, 2, 3], "b": 10})).unwrap();
        assert_eq!(
            children,
            vec![
                json!({"a": 1, "b": 10}),
                json!({"a": 2, "b": 10}),
                json!({"a": 3, "b": 10}),
            ]
        );
    }

    #[test]
    fn cartesian_order_is_lexicographic_over_port_then_index() {
        let schema = ObjectSchema::new()
            .with_port("y", PortSchema::number().replicated())
            .with_port("x", PortSchema::number().replicated());
        // Ports sort as ["x", "y"]; x is the most significant digit.
        let children =
            expand_input(&schema, &json!({"x": [1, 2], "y": [10, 20]})).unwrap();
        assert_eq!(
            children,
            vec![
                json!({"x": 1, "y": 10}),
                json!({"x": 1, "y": 20}),
                json!({"x": 2, "y": 10}),
                json!({"x": 2, "y": 20}),
            ]
        );
    }

    #[test]
    fn empty_replicated_array_expands_to_nothing() {
        let schema = fan_schema();
        let children = expand_input(&schema, &json!({"a": [], "b": 10})).unwrap();
        assert!(children.is_empty());
    }

    #[test]
    fn expand_builds_ordered_children() {
        let parent = fan_task();
        let expansion = expand(&parent, &json!({"a": [1, 2, 3], "b": 10})).unwrap();
        assert_eq!(expansion.len(), 3);
        assert_eq!(
            expansion.child_ids,
            vec!["m[0]", "m[1]", "m[2]"]
        );
        assert!(parent.sub_graph().is_some());
        let child = expansion.graph.task("m[1]").unwrap();
        assert_eq!(child.parent_task_id().as_deref(), Some("m"));
    }

    #[test]
    fn merge_uses_default_concatenation() {
        let parent = fan_task();
        let outputs = vec![json!({"result": 10.0}), json!({"result": 20.0})];
        let merged = merge(&parent, &json!({}), &outputs).unwrap();
        assert_eq!(merged, json!({"result": [10.0, 20.0]}));
    }

    #[test]
    fn expansion_is_deterministic() {
        let schema = ObjectSchema::new()
            .with_port("p", PortSchema::of(PortType::Any).replicated())
            .with_port("q", PortSchema::of(PortType::Any).replicated());
        let input = json!({"p": ["a", "b"], "q": [1, 2, 3]});
        let first = expand_input(&schema, &input).unwrap();
        let second = expand_input(&schema, &input).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 6);
    }
}
