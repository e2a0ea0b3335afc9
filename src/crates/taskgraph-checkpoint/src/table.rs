//! Checkpoint saver over a [`TabularStorage`] backend
//!
//! Maps [`CheckpointData`] onto one table row per checkpoint. Blobs travel as
//! base64 strings inside the row (the [`CompressedBlob`] serde form), so any
//! backend that stores JSON rows can persist checkpoints without knowing
//! their structure.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::debug;

use taskgraph_storage::{Key, Row, TableSchema, TabularStorage};

use crate::compress::CompressedBlob;
use crate::data::{CheckpointData, CheckpointMetadata};
use crate::error::{CheckpointError, Result};
use crate::saver::CheckpointSaver;

/// Table name used by [`TableCheckpointSaver::schema`]
pub const CHECKPOINTS_TABLE: &str = "checkpoints";

/// [`CheckpointSaver`] backed by a tabular store
pub struct TableCheckpointSaver {
    table: Arc<dyn TabularStorage>,
}

impl TableCheckpointSaver {
    /// Wrap an existing table (must use [`TableCheckpointSaver::schema`])
    pub fn new(table: Arc<dyn TabularStorage>) -> Self {
        Self { table }
    }

    /// The schema a backing table must be created with
    pub fn schema() -> TableSchema {
        TableSchema::new(CHECKPOINTS_TABLE)
            .with_columns([
                "checkpoint_id",
                "thread_id",
                "parent_checkpoint_id",
                "created_at",
                "iteration_parent_task_id",
                "graph",
                "task_states",
                "dataflow_states",
            ])
            .with_primary_key(["checkpoint_id"])
            .with_index(["thread_id"])
    }

    fn to_row(data: &CheckpointData) -> Result<Row> {
        Ok(json!({
            "checkpoint_id": data.checkpoint_id,
            "thread_id": data.thread_id,
            "parent_checkpoint_id": data.parent_checkpoint_id,
            "created_at": data.metadata.created_at.to_rfc3339(),
            "iteration_parent_task_id": data.metadata.iteration_parent_task_id,
            "graph": serde_json::to_value(&data.graph)?,
            "task_states": serde_json::to_value(&data.task_states)?,
            "dataflow_states": serde_json::to_value(&data.dataflow_states)?,
        }))
    }

    fn from_row(row: &Row) -> Result<CheckpointData> {
        let field = |name: &str| -> Result<&Value> {
            row.get(name)
                .ok_or_else(|| CheckpointError::Corrupt(format!("missing column '{name}'")))
        };
        let string = |name: &str| -> Result<String> {
            field(name)?
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| CheckpointError::Corrupt(format!("column '{name}' is not a string")))
        };
        let opt_string = |name: &str| -> Option<String> {
            row.get(name).and_then(Value::as_str).map(str::to_string)
        };
        let blob = |name: &str| -> Result<CompressedBlob> {
            Ok(serde_json::from_value(field(name)?.clone())?)
        };

        let created_at: DateTime<Utc> = string("created_at")?
            .parse()
            .map_err(|e| CheckpointError::Corrupt(format!("bad created_at: {e}")))?;

        Ok(CheckpointData {
            checkpoint_id: string("checkpoint_id")?,
            thread_id: string("thread_id")?,
            parent_checkpoint_id: opt_string("parent_checkpoint_id"),
            graph: blob("graph")?,
            task_states: blob("task_states")?,
            dataflow_states: blob("dataflow_states")?,
            metadata: CheckpointMetadata {
                created_at,
                iteration_parent_task_id: opt_string("iteration_parent_task_id"),
            },
        })
    }
}

#[async_trait]
impl CheckpointSaver for TableCheckpointSaver {
    async fn save(&self, data: CheckpointData) -> Result<()> {
        debug!(
            checkpoint_id = %data.checkpoint_id,
            thread_id = %data.thread_id,
            graph_bytes = data.graph.len(),
            "saving checkpoint"
        );
        self.table.put(Self::to_row(&data)?).await?;
        Ok(())
    }

    async fn get(&self, checkpoint_id: &str) -> Result<Option<CheckpointData>> {
        let key = Key::new().with("checkpoint_id", json!(checkpoint_id));
        match self.table.get(&key).await? {
            Some(row) => Ok(Some(Self::from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_latest(&self, thread_id: &str) -> Result<Option<CheckpointData>> {
        Ok(self.history(thread_id).await?.into_iter().next())
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<CheckpointData>> {
        let rows = self
            .table
            .search(&Key::new().with("thread_id", json!(thread_id)))
            .await?;
        let mut history = rows
            .iter()
            .map(Self::from_row)
            .collect::<Result<Vec<_>>>()?;
        history.sort_by(|a, b| b.metadata.created_at.cmp(&a.metadata.created_at));
        Ok(history)
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<u64> {
        Ok(self
            .table
            .delete_search(&Key::new().with("thread_id", json!(thread_id)))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::CheckpointBuilder;
    use chrono::Duration;
    use taskgraph_storage::InMemoryTable;

    fn saver() -> TableCheckpointSaver {
        TableCheckpointSaver::new(Arc::new(InMemoryTable::new(TableCheckpointSaver::schema())))
    }

    #[tokio::test]
    async fn roundtrip_through_table() {
        let saver = saver();
        let data = CheckpointBuilder::new("thread-1")
            .graph(&json!({"tasks": {"a": {"type": "upper"}}}))
            .unwrap()
            .task_states(&json!({"a": {"status": "completed", "progress": 100}}))
            .unwrap()
            .build();
        let id = data.checkpoint_id.clone();
        saver.save(data).await.unwrap();

        let loaded = saver.get(&id).await.unwrap().unwrap();
        assert_eq!(
            loaded.task_states.to_json().unwrap(),
            json!({"a": {"status": "completed", "progress": 100}})
        );
        assert_eq!(loaded.thread_id, "thread-1");
    }

    #[tokio::test]
    async fn parent_chain_survives_storage() {
        let saver = saver();
        let first = CheckpointBuilder::new("t").build();
        let first_id = first.checkpoint_id.clone();
        saver.save(first).await.unwrap();

        let second = CheckpointBuilder::new("t")
            .parent(first_id.clone())
            .created_at(Utc::now() + Duration::seconds(1))
            .build();
        saver.save(second).await.unwrap();

        let latest = saver.get_latest("t").await.unwrap().unwrap();
        assert_eq!(latest.parent_checkpoint_id.as_deref(), Some(first_id.as_str()));

        let history = saver.history("t").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].checkpoint_id, first_id);
    }

    #[tokio::test]
    async fn delete_thread_counts_rows() {
        let saver = saver();
        saver.save(CheckpointBuilder::new("t").build()).await.unwrap();
        saver.save(CheckpointBuilder::new("t").build()).await.unwrap();
        assert_eq!(saver.delete_thread("t").await.unwrap(), 2);
        assert!(saver.get_latest("t").await.unwrap().is_none());
    }
}
