//! Error types for queue operations

use thiserror::Error;

/// Convenience alias for queue results
pub type Result<T> = std::result::Result<T, QueueError>;

/// Error type for job-queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    /// No job with the given id
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Another worker claimed the job first; retry with jitter
    #[error("claim conflict on job '{0}'")]
    ClaimConflict(String),

    /// Invalid job state for the requested transition
    #[error("job '{job_id}' is {status}, cannot {operation}")]
    InvalidState {
        /// The job
        job_id: String,
        /// Its current status
        status: String,
        /// What was attempted
        operation: String,
    },

    /// Misconfiguration (bad queue name, zero capacity, ...)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Cooperative cancellation observed
    #[error("job cancelled{}", job_id.as_ref().map(|id| format!(": {id}")).unwrap_or_default())]
    Cancelled {
        /// The job, when known
        job_id: Option<String>,
    },

    /// The handler failed; retried per the server's policy when transient
    #[error("handler error: {0}")]
    Handler(String),

    /// Transient storage trouble; the server backs off and continues
    #[error("storage error: {0}")]
    Storage(String),

    /// Payload (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    /// Whether the server should retry after backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            QueueError::ClaimConflict(_) | QueueError::Storage(_) | QueueError::Handler(_)
        )
    }

    /// Whether this is a cooperative cancellation
    pub fn is_cancellation(&self) -> bool {
        matches!(self, QueueError::Cancelled { .. })
    }
}

impl From<taskgraph_storage::StorageError> for QueueError {
    fn from(err: taskgraph_storage::StorageError) -> Self {
        QueueError::Storage(err.to_string())
    }
}
