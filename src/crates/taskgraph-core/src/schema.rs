//! Port schemas: typed task inputs/outputs with streaming and replication hints
//!
//! A task declares an [`ObjectSchema`] for each side of its contract: a set of
//! named ports, each with a [`PortType`], an optional default, a `replicate`
//! flag (drives array expansion), and a [`StreamMode`] (drives chunk
//! composition along dataflow edges).
//!
//! Schemas are plain data. The engine performs only *structural* validation -
//! required ports present, replicated ports scalar-or-array, loose type check -
//! leaving rich validation to external schema tooling consumed by task
//! implementations.
//!
//! # Stream Modes
//!
//! | Mode      | Chunk semantics                              |
//! |-----------|----------------------------------------------|
//! | `none`    | Port carries one full value at finish        |
//! | `append`  | Text deltas concatenate into the final value |
//! | `replace` | Each snapshot replaces the previous value    |
//!
//! [`edge_needs_accumulation`] decides whether the runner must materialize a
//! stream before unblocking the edge's target: it must exactly when the source
//! streams and the target expects a different composition than the source
//! produces.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, TaskGraphError};

/// How chunk events compose into a port value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// One full value, delivered when the producer finishes
    #[default]
    None,
    /// Text deltas accumulate by concatenation
    Append,
    /// Snapshots replace the previous value
    Replace,
}

/// Loose value type of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortType {
    /// Any JSON value
    #[default]
    Any,
    /// JSON string
    Text,
    /// JSON number
    Number,
    /// JSON boolean
    Boolean,
    /// JSON object
    Object,
    /// JSON array (as the port's scalar type, distinct from replication)
    Array,
    /// Typed binary payload (`{"kind", "base64"}` wire form)
    Binary,
}

impl PortType {
    /// Whether `value` is acceptable for this type
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            PortType::Any => true,
            PortType::Text => value.is_string(),
            PortType::Number => value.is_number(),
            PortType::Boolean => value.is_boolean(),
            PortType::Object => value.is_object(),
            PortType::Array => value.is_array(),
            PortType::Binary => crate::fingerprint::decode_bytes(value).is_some(),
        }
    }
}

/// Declared shape of one port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortSchema {
    /// Loose value type
    pub port_type: PortType,

    /// Value used when the port is absent from the input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Whether the port must be present (or defaulted) at run time
    #[serde(default = "default_required")]
    pub required: bool,

    /// Whether an array value fans the task out into a sub-graph
    #[serde(default)]
    pub replicate: bool,

    /// Chunk composition along edges touching this port
    #[serde(default)]
    pub stream_mode: StreamMode,

    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_required() -> bool {
    true
}

impl PortSchema {
    /// A required port of the given type
    pub fn of(port_type: PortType) -> Self {
        Self {
            port_type,
            default: None,
            required: true,
            replicate: false,
            stream_mode: StreamMode::None,
            description: None,
        }
    }

    /// Shorthand for a text port
    pub fn text() -> Self {
        Self::of(PortType::Text)
    }

    /// Shorthand for a number port
    pub fn number() -> Self {
        Self::of(PortType::Number)
    }

    /// Make the port optional with a default value
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self.required = false;
        self
    }

    /// Make the port optional without a default
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Mark the port as replication-driving
    pub fn replicated(mut self) -> Self {
        self.replicate = true;
        self
    }

    /// Set the port's stream mode
    pub fn streaming(mut self, mode: StreamMode) -> Self {
        self.stream_mode = mode;
        self
    }

    /// Attach a description
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// An ordered collection of named ports
///
/// Port order is declaration order; it matters for deterministic array
/// expansion and for schema display.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectSchema {
    ports: Vec<(String, PortSchema)>,
}

impl ObjectSchema {
    /// An empty schema (no ports)
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a port; replaces any existing port of the same name
    pub fn with_port(mut self, name: impl Into<String>, schema: PortSchema) -> Self {
        let name = name.into();
        self.ports.retain(|(existing, _)| *existing != name);
        self.ports.push((name, schema));
        self
    }

    /// Look up one port
    pub fn port(&self, name: &str) -> Option<&PortSchema> {
        self.ports
            .iter()
            .find(|(port, _)| port == name)
            .map(|(_, schema)| schema)
    }

    /// Whether the schema declares `name`
    pub fn has_port(&self, name: &str) -> bool {
        self.port(name).is_some()
    }

    /// Port names in declaration order
    pub fn names(&self) -> Vec<&str> {
        self.ports.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Iterate `(name, schema)` pairs in declaration order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PortSchema)> {
        self.ports
            .iter()
            .map(|(name, schema)| (name.as_str(), schema))
    }

    /// Whether the schema declares no ports
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Ports with `replicate: true`, in declaration order
    pub fn replicated_ports(&self) -> Vec<&str> {
        self.ports
            .iter()
            .filter(|(_, schema)| schema.replicate)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Stream mode of one port (`None` if the port is undeclared)
pub fn port_stream_mode(schema: &ObjectSchema, port: &str) -> StreamMode {
    schema
        .port(port)
        .map(|p| p.stream_mode)
        .unwrap_or(StreamMode::None)
}

/// Dominant stream mode of an output schema
///
/// `Append` wins over `Replace`, which wins over `None`. A task with any
/// appending output port is driven through its streaming path.
pub fn output_stream_mode(schema: &ObjectSchema) -> StreamMode {
    let mut mode = StreamMode::None;
    for (_, port) in schema.iter() {
        match port.stream_mode {
            StreamMode::Append => return StreamMode::Append,
            StreamMode::Replace => mode = StreamMode::Replace,
            StreamMode::None => {}
        }
    }
    mode
}

/// Whether the runner must materialize a stream crossing this edge
///
/// True iff the source port streams and the target port composes chunks
/// differently than the source produces them (including not at all).
pub fn edge_needs_accumulation(
    source_schema: &ObjectSchema,
    source_port: &str,
    target_schema: &ObjectSchema,
    target_port: &str,
) -> bool {
    let source_mode = port_stream_mode(source_schema, source_port);
    if source_mode == StreamMode::None {
        return false;
    }
    port_stream_mode(target_schema, target_port) != source_mode
}

/// Structurally validate `input` against `schema`, applying defaults
///
/// Returns the effective input object. Checks, per port:
/// - required ports present or defaulted
/// - non-replicated ports match their declared type
/// - replicated ports match either the scalar type or an array of it
pub fn validate_input(task: &str, schema: &ObjectSchema, input: &Value) -> Result<Value> {
    let provided = match input {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        _ => {
            return Err(TaskGraphError::validation(
                task,
                "task input must be a JSON object",
            ))
        }
    };

    let mut effective = Map::new();
    for (name, port) in schema.iter() {
        let value = provided
            .get(name)
            .cloned()
            .or_else(|| port.default.clone());
        let value = match value {
            Some(value) => value,
            None if port.required => {
                return Err(TaskGraphError::validation(
                    task,
                    format!("missing required input port '{name}'"),
                ));
            }
            None => continue,
        };

        let acceptable = if port.replicate {
            match &value {
                Value::Array(items) => items.iter().all(|item| port.port_type.accepts(item)),
                scalar => port.port_type.accepts(scalar),
            }
        } else {
            port.port_type.accepts(&value)
        };
        if !acceptable {
            return Err(TaskGraphError::validation(
                task,
                format!("input port '{name}' rejected value of the wrong type"),
            ));
        }
        effective.insert(name.to_string(), value);
    }

    // Undeclared ports pass through untouched; downstream tasks may consume
    // them through `any`-typed schemas.
    for (name, value) in provided {
        effective.entry(name).or_insert(value);
    }

    Ok(Value::Object(effective))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn streaming_out() -> ObjectSchema {
        ObjectSchema::new()
            .with_port("text", PortSchema::text().streaming(StreamMode::Append))
            .with_port("meta", PortSchema::of(PortType::Object).optional())
    }

    #[test]
    fn output_stream_mode_append_wins() {
        assert_eq!(output_stream_mode(&streaming_out()), StreamMode::Append);

        let replace_only = ObjectSchema::new()
            .with_port("doc", PortSchema::of(PortType::Object).streaming(StreamMode::Replace));
        assert_eq!(output_stream_mode(&replace_only), StreamMode::Replace);
        assert_eq!(output_stream_mode(&ObjectSchema::new()), StreamMode::None);
    }

    #[test]
    fn accumulation_needed_when_modes_differ() {
        let source = streaming_out();
        let sink_plain = ObjectSchema::new().with_port("text", PortSchema::text());
        let sink_append = ObjectSchema::new()
            .with_port("text", PortSchema::text().streaming(StreamMode::Append));

        assert!(edge_needs_accumulation(&source, "text", &sink_plain, "text"));
        assert!(!edge_needs_accumulation(&source, "text", &sink_append, "text"));
        // Non-streaming source never needs accumulation.
        assert!(!edge_needs_accumulation(&sink_plain, "text", &source, "text"));
    }

    #[test]
    fn validate_applies_defaults_and_requires() {
        let schema = ObjectSchema::new()
            .with_port("text", PortSchema::text())
            .with_port("count", PortSchema::number().with_default(json!(1)));

        let effective = validate_input("t", &schema, &json!({"text": "hi"})).unwrap();
        assert_eq!(effective, json!({"text": "hi", "count": 1}));

        let err = validate_input("t", &schema, &json!({"count": 3})).unwrap_err();
        assert!(matches!(err, TaskGraphError::Validation { .. }));
    }

    #[test]
    fn validate_checks_replicated_shape() {
        let schema = ObjectSchema::new()
            .with_port("n", PortSchema::number().replicated());

        assert!(validate_input("t", &schema, &json!({"n": 2})).is_ok());
        assert!(validate_input("t", &schema, &json!({"n": [1, 2, 3]})).is_ok());
        assert!(validate_input("t", &schema, &json!({"n": ["x"]})).is_err());
    }

    #[test]
    fn with_port_replaces_duplicates() {
        let schema = ObjectSchema::new()
            .with_port("a", PortSchema::text())
            .with_port("a", PortSchema::number());
        assert_eq!(schema.names(), vec!["a"]);
        assert_eq!(schema.port("a").unwrap().port_type, PortType::Number);
    }
}
