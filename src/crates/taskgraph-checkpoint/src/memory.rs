//! In-memory checkpoint saver

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::data::CheckpointData;
use crate::error::Result;
use crate::saver::CheckpointSaver;

/// Process-local [`CheckpointSaver`]
///
/// Suitable for tests and single-process runs; state is lost on drop.
#[derive(Default)]
pub struct InMemoryCheckpointSaver {
    /// thread_id -> checkpoints in insertion order
    threads: RwLock<HashMap<String, Vec<CheckpointData>>>,
}

impl InMemoryCheckpointSaver {
    /// Create an empty saver
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of checkpoints across all threads (for tests)
    pub fn total_checkpoints(&self) -> usize {
        self.threads.read().values().map(Vec::len).sum()
    }
}

#[async_trait]
impl CheckpointSaver for InMemoryCheckpointSaver {
    async fn save(&self, data: CheckpointData) -> Result<()> {
        let mut threads = self.threads.write();
        threads
            .entry(data.thread_id.clone())
            .or_default()
            .push(data);
        Ok(())
    }

    async fn get(&self, checkpoint_id: &str) -> Result<Option<CheckpointData>> {
        let threads = self.threads.read();
        Ok(threads
            .values()
            .flatten()
            .find(|c| c.checkpoint_id == checkpoint_id)
            .cloned())
    }

    async fn get_latest(&self, thread_id: &str) -> Result<Option<CheckpointData>> {
        let threads = self.threads.read();
        Ok(threads.get(thread_id).and_then(|checkpoints| {
            checkpoints
                .iter()
                .max_by_key(|c| c.metadata.created_at)
                .cloned()
        }))
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<CheckpointData>> {
        let threads = self.threads.read();
        let mut history = threads.get(thread_id).cloned().unwrap_or_default();
        history.sort_by(|a, b| b.metadata.created_at.cmp(&a.metadata.created_at));
        Ok(history)
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<u64> {
        let mut threads = self.threads.write();
        Ok(threads
            .remove(thread_id)
            .map(|checkpoints| checkpoints.len() as u64)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::CheckpointBuilder;
    use chrono::{Duration, Utc};
    use serde_json::json;

    #[tokio::test]
    async fn save_and_get_roundtrip() {
        let saver = InMemoryCheckpointSaver::new();
        let data = CheckpointBuilder::new("t1")
            .graph(&json!({"tasks": {"a": {}}}))
            .unwrap()
            .build();
        let id = data.checkpoint_id.clone();
        saver.save(data).await.unwrap();

        let loaded = saver.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.graph.to_json().unwrap(), json!({"tasks": {"a": {}}}));
    }

    #[tokio::test]
    async fn history_is_newest_first() {
        let saver = InMemoryCheckpointSaver::new();
        let base = Utc::now();
        for i in 0..3 {
            let data = CheckpointBuilder::new("t1")
                .created_at(base + Duration::seconds(i))
                .build();
            saver.save(data).await.unwrap();
        }
        let history = saver.history("t1").await.unwrap();
        assert_eq!(history.len(), 3);
        assert!(history[0].metadata.created_at > history[2].metadata.created_at);

        let latest = saver.get_latest("t1").await.unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, history[0].checkpoint_id);
    }

    #[tokio::test]
    async fn delete_thread_removes_all() {
        let saver = InMemoryCheckpointSaver::new();
        saver.save(CheckpointBuilder::new("t1").build()).await.unwrap();
        saver.save(CheckpointBuilder::new("t1").build()).await.unwrap();
        saver.save(CheckpointBuilder::new("t2").build()).await.unwrap();

        assert_eq!(saver.delete_thread("t1").await.unwrap(), 2);
        assert_eq!(saver.total_checkpoints(), 1);
        assert!(saver.get_latest("t1").await.unwrap().is_none());
    }
}
