//! Error types for storage operations

use thiserror::Error;

/// Convenience alias for storage results
pub type Result<T> = std::result::Result<T, StorageError>;

/// Error type for tabular storage operations
///
/// Backends map their native failures onto these variants so callers can
/// distinguish transient I/O problems (worth retrying) from misuse.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Row not found for a complete key
    #[error("row not found in table '{table}': {key}")]
    NotFound {
        /// Table the lookup targeted
        table: String,
        /// Rendered key that missed
        key: String,
    },

    /// Key references a column the schema does not declare
    #[error("unknown column '{column}' in table '{table}'")]
    UnknownColumn {
        /// Table the operation targeted
        table: String,
        /// Offending column name
        column: String,
    },

    /// Row is missing a required key column
    #[error("row for table '{table}' is missing key column '{column}'")]
    MissingKeyColumn {
        /// Table the operation targeted
        table: String,
        /// Missing column name
        column: String,
    },

    /// No declared index can answer the given partial key
    #[error("no index on table '{table}' matches columns {columns:?}")]
    NoMatchingIndex {
        /// Table the search targeted
        table: String,
        /// Columns the caller provided
        columns: Vec<String>,
    },

    /// Underlying backend failure (connection loss, disk error, ...)
    ///
    /// Treated as transient by callers with retry policies.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Row or key failed to serialize
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Whether a retry may succeed without operator intervention
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Backend(_))
    }
}
