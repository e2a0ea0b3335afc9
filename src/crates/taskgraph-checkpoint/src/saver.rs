//! The [`CheckpointSaver`] storage trait
//!
//! Backends implement five operations; everything else (parent-chain walking,
//! iteration correlation) is derived by callers from [`CheckpointData`] fields.
//! Implementations must be safe for concurrent use: saves are append-only per
//! thread and never mutate an existing checkpoint.

use async_trait::async_trait;

use crate::data::CheckpointData;
use crate::error::Result;

/// Storage contract for checkpoint persistence
///
/// # Ordering
///
/// `history` returns a thread's checkpoints newest-first by
/// `metadata.created_at`; `get_latest` is equivalent to the head of that
/// list. Timestamps are assigned by the writer, so clock skew between
/// writers of the *same thread* is the caller's problem - in practice one
/// runner owns a thread.
#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Persist a checkpoint
    async fn save(&self, data: CheckpointData) -> Result<()>;

    /// Fetch one checkpoint by id
    async fn get(&self, checkpoint_id: &str) -> Result<Option<CheckpointData>>;

    /// The newest checkpoint of a thread, if any
    async fn get_latest(&self, thread_id: &str) -> Result<Option<CheckpointData>>;

    /// All checkpoints of a thread, newest first
    async fn history(&self, thread_id: &str) -> Result<Vec<CheckpointData>>;

    /// Remove every checkpoint of a thread; returns the number removed
    async fn delete_thread(&self, thread_id: &str) -> Result<u64>;
}
