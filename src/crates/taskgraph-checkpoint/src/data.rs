//! Checkpoint snapshot types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::compress::CompressedBlob;
use crate::error::Result;

/// Metadata recorded alongside every checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// When the snapshot was taken; orders a thread's history
    pub created_at: DateTime<Utc>,

    /// For per-iteration snapshots of looping composite tasks, the id of the
    /// task whose sub-graph regeneration produced this checkpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration_parent_task_id: Option<String>,
}

/// One persisted snapshot of a running graph
///
/// The three blobs hold, respectively: the graph topology (tasks + dataflows
/// as declared), every task's runtime state, and every dataflow's delivered
/// value. They are stored separately so a consumer inspecting history can
/// inflate only what it needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointData {
    /// Unique id of this snapshot
    pub checkpoint_id: String,

    /// Logical execution this snapshot belongs to
    pub thread_id: String,

    /// Previous snapshot in the same thread, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_checkpoint_id: Option<String>,

    /// Compressed graph topology JSON
    pub graph: CompressedBlob,

    /// Compressed per-task runtime state JSON
    pub task_states: CompressedBlob,

    /// Compressed per-dataflow delivered-value JSON
    pub dataflow_states: CompressedBlob,

    /// Creation time and iteration correlation
    pub metadata: CheckpointMetadata,
}

/// Builder assembling a [`CheckpointData`] from uncompressed state
pub struct CheckpointBuilder {
    thread_id: String,
    parent_checkpoint_id: Option<String>,
    iteration_parent_task_id: Option<String>,
    created_at: DateTime<Utc>,
    graph: Option<CompressedBlob>,
    task_states: Option<CompressedBlob>,
    dataflow_states: Option<CompressedBlob>,
}

impl CheckpointBuilder {
    /// Start a checkpoint for `thread_id`
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            parent_checkpoint_id: None,
            iteration_parent_task_id: None,
            created_at: Utc::now(),
            graph: None,
            task_states: None,
            dataflow_states: None,
        }
    }

    /// Link to the previous checkpoint in the thread
    pub fn parent(mut self, parent_checkpoint_id: impl Into<String>) -> Self {
        self.parent_checkpoint_id = Some(parent_checkpoint_id.into());
        self
    }

    /// Correlate this snapshot with a looping task's iteration
    pub fn iteration_parent(mut self, task_id: impl Into<String>) -> Self {
        self.iteration_parent_task_id = Some(task_id.into());
        self
    }

    /// Override the creation timestamp (tests, imports)
    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Compress and attach the graph topology
    pub fn graph(mut self, graph: &Value) -> Result<Self> {
        self.graph = Some(CompressedBlob::from_json(graph)?);
        Ok(self)
    }

    /// Compress and attach per-task state
    pub fn task_states(mut self, task_states: &Value) -> Result<Self> {
        self.task_states = Some(CompressedBlob::from_json(task_states)?);
        Ok(self)
    }

    /// Compress and attach per-dataflow state
    pub fn dataflow_states(mut self, dataflow_states: &Value) -> Result<Self> {
        self.dataflow_states = Some(CompressedBlob::from_json(dataflow_states)?);
        Ok(self)
    }

    /// Finish the checkpoint, generating its id
    ///
    /// Missing blobs default to empty objects so partially-populated
    /// checkpoints (e.g. topology-only) remain loadable.
    pub fn build(self) -> CheckpointData {
        let empty = || {
            CompressedBlob::from_json(&Value::Object(Default::default()))
                .unwrap_or_else(|_| CompressedBlob::from_bytes(Vec::new()))
        };
        CheckpointData {
            checkpoint_id: Uuid::new_v4().to_string(),
            thread_id: self.thread_id,
            parent_checkpoint_id: self.parent_checkpoint_id,
            graph: self.graph.unwrap_or_else(empty),
            task_states: self.task_states.unwrap_or_else(empty),
            dataflow_states: self.dataflow_states.unwrap_or_else(empty),
            metadata: CheckpointMetadata {
                created_at: self.created_at,
                iteration_parent_task_id: self.iteration_parent_task_id,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_populates_fields() {
        let data = CheckpointBuilder::new("thread-1")
            .parent("ckpt-0")
            .iteration_parent("loop-task")
            .graph(&json!({"tasks": {}}))
            .unwrap()
            .build();

        assert_eq!(data.thread_id, "thread-1");
        assert_eq!(data.parent_checkpoint_id.as_deref(), Some("ckpt-0"));
        assert_eq!(
            data.metadata.iteration_parent_task_id.as_deref(),
            Some("loop-task")
        );
        assert_eq!(data.graph.to_json().unwrap(), json!({"tasks": {}}));
        // Unset blobs decode to empty objects.
        assert_eq!(data.task_states.to_json().unwrap(), json!({}));
    }

    #[test]
    fn checkpoint_serde_roundtrip() {
        let data = CheckpointBuilder::new("t")
            .task_states(&json!({"a": {"status": "completed"}}))
            .unwrap()
            .build();
        let encoded = serde_json::to_string(&data).unwrap();
        let decoded: CheckpointData = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.checkpoint_id, data.checkpoint_id);
        assert_eq!(
            decoded.task_states.to_json().unwrap(),
            json!({"a": {"status": "completed"}})
        );
    }
}
