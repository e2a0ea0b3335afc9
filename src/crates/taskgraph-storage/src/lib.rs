//! Tabular storage abstractions for the taskgraph engine
//!
//! This crate defines the **[`TabularStorage`]** trait - the persistence seam shared
//! by the task-output cache, the checkpoint saver, and the durable job queue. A table
//! is a set of rows (JSON objects) addressed by composite keys, with declared indexes
//! used to answer partial-key searches.
//!
//! # Core Types
//!
//! - [`TabularStorage`] - Async storage contract (put/get/delete/search/subscribe)
//! - [`TableSchema`] - Column and index declarations for a table
//! - [`Key`] - A partial or complete composite key
//! - [`ChangeEvent`] - Notification emitted on every mutation
//! - [`InMemoryTable`] - Reference implementation backed by process memory
//!
//! # Index Selection
//!
//! A search with a partial key must be answered through the *best matching index*:
//! the declared index with the longest prefix fully covered by the provided columns,
//! ties broken by declaration order. [`TableSchema::select_index`] implements this
//! rule so every backend resolves partial keys identically.
//!
//! # Example
//!
//! ```rust,ignore
//! use taskgraph_storage::{InMemoryTable, Key, TableSchema, TabularStorage};
//! use serde_json::json;
//!
//! let schema = TableSchema::new("jobs")
//!     .with_columns(["queue_name", "id", "status"])
//!     .with_primary_key(["queue_name", "id"])
//!     .with_index(["queue_name", "status"]);
//!
//! let table = InMemoryTable::new(schema);
//! table.setup().await?;
//! table.put(json!({"queue_name": "default", "id": "j1", "status": "pending"})).await?;
//!
//! let pending = table
//!     .search(&Key::new().with("queue_name", json!("default")))
//!     .await?;
//! assert_eq!(pending.len(), 1);
//! ```

pub mod error;
pub mod memory;
pub mod table;

pub use error::{Result, StorageError};
pub use memory::InMemoryTable;
pub use table::{
    ChangeEvent, ChangeKind, ChangeListener, Key, Row, SubscribeOptions, Subscription,
    TableSchema, TabularStorage,
};
