//! Error types for checkpoint operations

use thiserror::Error;

/// Convenience alias for checkpoint results
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Error type for checkpoint save/restore operations
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Checkpoint id not present in storage
    #[error("checkpoint not found: {0}")]
    NotFound(String),

    /// Compressed blob failed to inflate or parse
    #[error("corrupt checkpoint blob: {0}")]
    Corrupt(String),

    /// Snapshot state failed to serialize
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying storage failure
    #[error(transparent)]
    Storage(#[from] taskgraph_storage::StorageError),

    /// Compression round-trip failure
    #[error("compression error: {0}")]
    Compression(String),
}
