//! Checkpoint persistence for the taskgraph engine
//!
//! A checkpoint is a compressed snapshot of a task graph mid-run: the graph
//! topology, every task's state (status, outputs, progress), and every
//! dataflow's delivered value. Checkpoints form a linked list per *thread*
//! (one logical execution) via `parent_checkpoint_id`, which supports resuming
//! after a crash, time-travel inspection, and correlating the per-iteration
//! snapshots of looping composite tasks through `iteration_parent_task_id`.
//!
//! # Core Types
//!
//! - [`CheckpointSaver`] - Storage trait (save / get / get_latest / history / delete_thread)
//! - [`CheckpointData`] - One snapshot: ids, three compressed blobs, metadata
//! - [`CompressedBlob`] - lz4-compressed canonical JSON
//! - [`InMemoryCheckpointSaver`] - Process-local implementation
//! - [`TableCheckpointSaver`] - Implementation over any [`TabularStorage`](taskgraph_storage::TabularStorage)
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use taskgraph_checkpoint::{CheckpointBuilder, CheckpointSaver, InMemoryCheckpointSaver};
//!
//! let saver = InMemoryCheckpointSaver::new();
//! let data = CheckpointBuilder::new("thread-1")
//!     .graph(&graph_json)?
//!     .task_states(&task_states_json)?
//!     .dataflow_states(&dataflow_states_json)?
//!     .build();
//! saver.save(data).await?;
//!
//! let latest = saver.get_latest("thread-1").await?;
//! ```
//!
//! The engine crate reconstructs a `TaskGraph` from the stored blobs; this
//! crate only knows about opaque snapshots so storage backends never depend
//! on engine types.

pub mod compress;
pub mod data;
pub mod error;
pub mod memory;
pub mod saver;
pub mod table;

pub use compress::{compress_json, decompress_json, CompressedBlob};
pub use data::{CheckpointBuilder, CheckpointData, CheckpointMetadata};
pub use error::{CheckpointError, Result};
pub use memory::InMemoryCheckpointSaver;
pub use saver::CheckpointSaver;
pub use table::TableCheckpointSaver;
