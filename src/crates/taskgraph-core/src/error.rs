//! Error types and error handling for the task-graph engine
//!
//! All failures surface as [`TaskGraphError`], which carries the taxonomy the
//! engine's retry and failure policies are written against:
//!
//! ```text
//! TaskGraphError
//! ├── Configuration   - malformed schema, bad graph edit, unknown task type (never retried)
//! ├── Validation      - runtime input fails its port schema (task FAILED, not retried)
//! ├── TaskFailure     - a task's execute returned an error (context attached)
//! ├── Transient       - storage/network/rate-limit trouble (retried with backoff)
//! ├── Cancelled       - cooperative cancellation (not an error in the usual sense)
//! ├── Timeout         - deadline exceeded (treated as cancellation unless retry_on_timeout)
//! ├── Fatal           - internal invariant violation; the run aborts
//! └── Checkpoint / Storage / Serialization - propagated from collaborators
//! ```
//!
//! Policy code never matches on message strings; it uses the [`TaskGraphError::is_transient`]
//! / [`TaskGraphError::is_cancellation`] predicates.

use thiserror::Error;

/// Convenience alias for engine results
pub type Result<T> = std::result::Result<T, TaskGraphError>;

/// Error type for all graph construction and execution operations
#[derive(Debug, Error)]
pub enum TaskGraphError {
    /// Structural misuse: malformed schema, duplicate ids, cycle-creating edge,
    /// unknown task type. Surfaced immediately and never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Runtime input failed its declared port schema
    #[error("validation error{}: {error}", task.as_ref().map(|t| format!(" in task '{t}'")).unwrap_or_default())]
    Validation {
        /// Task whose input was rejected, when known
        task: Option<String>,
        /// What was wrong with the input
        error: String,
    },

    /// A task's `execute` failed; carries the context user-visible failure
    /// reports need (task id, type, message, last observed progress)
    #[error("task '{task_id}' ({task_type}) failed: {error}")]
    TaskFailure {
        /// Id of the failed task
        task_id: String,
        /// Registered type of the failed task
        task_type: String,
        /// Failure message
        error: String,
        /// Last progress the task reported before failing
        progress: Option<f32>,
    },

    /// Transient I/O trouble: storage hiccup, network failure, rate-limit deny.
    /// Retried with backoff up to the applicable retry policy.
    #[error("transient error: {0}")]
    Transient(String),

    /// Cooperative cancellation was observed
    #[error("cancelled{}", task.as_ref().map(|t| format!(" in task '{t}'")).unwrap_or_default())]
    Cancelled {
        /// Task that observed the cancellation, when known
        task: Option<String>,
    },

    /// A deadline elapsed
    #[error("timed out after {elapsed_ms}ms{}", task.as_ref().map(|t| format!(" in task '{t}'")).unwrap_or_default())]
    Timeout {
        /// Task that timed out, when known
        task: Option<String>,
        /// How long the operation ran before the deadline fired
        elapsed_ms: u64,
    },

    /// Internal invariant violation; the run aborts and surfaces the cause
    #[error("fatal: {0}")]
    Fatal(String),

    /// Checkpoint persistence failure
    #[error(transparent)]
    Checkpoint(#[from] taskgraph_checkpoint::CheckpointError),

    /// Tabular storage failure
    #[error(transparent)]
    Storage(#[from] taskgraph_storage::StorageError),

    /// JSON (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TaskGraphError {
    /// Configuration error from anything displayable
    pub fn configuration(msg: impl std::fmt::Display) -> Self {
        Self::Configuration(msg.to_string())
    }

    /// Validation error with task context
    pub fn validation(task: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::Validation {
            task: Some(task.into()),
            error: error.to_string(),
        }
    }

    /// Task failure with full context
    pub fn task_failure(
        task_id: impl Into<String>,
        task_type: impl Into<String>,
        error: impl std::fmt::Display,
        progress: Option<f32>,
    ) -> Self {
        Self::TaskFailure {
            task_id: task_id.into(),
            task_type: task_type.into(),
            error: error.to_string(),
            progress,
        }
    }

    /// Cancellation without task context
    pub fn cancelled() -> Self {
        Self::Cancelled { task: None }
    }

    /// Whether a retry may succeed without intervention
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Storage(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Whether this error is a cooperative cancellation (or a timeout, which
    /// the engine treats as cancellation unless a policy says otherwise)
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_task_context() {
        let err = TaskGraphError::task_failure("t1", "upper", "boom", Some(42.0));
        assert_eq!(err.to_string(), "task 't1' (upper) failed: boom");

        let err = TaskGraphError::validation("t1", "missing port 'text'");
        assert!(err.to_string().contains("in task 't1'"));
    }

    #[test]
    fn transient_predicate() {
        assert!(TaskGraphError::Transient("net".into()).is_transient());
        assert!(!TaskGraphError::Configuration("bad".into()).is_transient());
        assert!(!TaskGraphError::cancelled().is_transient());
    }

    #[test]
    fn cancellation_predicate_covers_timeout() {
        assert!(TaskGraphError::cancelled().is_cancellation());
        assert!(TaskGraphError::Timeout { task: None, elapsed_ms: 10 }.is_cancellation());
        assert!(!TaskGraphError::Fatal("x".into()).is_cancellation());
    }
}
