//! # taskgraph-core - Reactive Task-Graph Execution Engine
//!
//! A runtime for directed acyclic graphs of typed tasks: build a
//! [`TaskGraph`] of [`Task`]s connected by port-to-port [`Dataflow`] edges,
//! then let the [`GraphRunner`] schedule every data-ready task concurrently,
//! stream partial outputs between them, and merge the leaves into a result.
//!
//! ## Core concepts
//!
//! - **Tasks** declare typed input/output ports ([`ObjectSchema`]) and
//!   implement [`TaskHandler`]: an authoritative `execute`, an optional cheap
//!   `execute_reactive`, an optional chunked `execute_stream`, and an
//!   `execute_merge` for array mode.
//! - **Dataflows** carry one value per port per run; streaming ports carry
//!   chunk sequences with `append`/`replace` composition and bounded-channel
//!   backpressure.
//! - **Replication**: an array arriving on a `replicate` port fans the task
//!   out into a deterministic sub-graph of per-element children whose outputs
//!   merge back into arrays.
//! - **Reactive runs** recompute downstream outputs cheaply when an upstream
//!   value changes, without re-running expensive execute paths.
//! - **Caching**: cacheable tasks short-circuit through a fingerprint-keyed
//!   output cache with singleflight execution.
//! - **Checkpoints**: graph, task, and dataflow state snapshot into
//!   compressed blobs (via `taskgraph-checkpoint`) and restore to a runnable
//!   graph.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use serde_json::json;
//! use taskgraph_core::{
//!     FnTaskHandler, ObjectSchema, PortSchema, ServiceContainer, TaskConfig,
//!     TaskRegistry, Workflow,
//! };
//!
//! let registry = TaskRegistry::new();
//! let services = ServiceContainer::new(registry);
//! let workflow = Workflow::new(services);
//!
//! workflow.add_task(
//!     Arc::new(FnTaskHandler::new(
//!         "hello",
//!         ObjectSchema::new(),
//!         ObjectSchema::new().with_port("text", PortSchema::text()),
//!         |_input, _ctx| async move { Ok(json!({"text": "hello"})) },
//!     )),
//!     TaskConfig::with_id("source"),
//! )?;
//! workflow.then(
//!     Arc::new(FnTaskHandler::new(
//!         "upper",
//!         ObjectSchema::new().with_port("text", PortSchema::text()),
//!         ObjectSchema::new().with_port("text", PortSchema::text()),
//!         |input, _ctx| async move {
//!             Ok(json!({"text": input["text"].as_str().unwrap_or("").to_uppercase()}))
//!         },
//!     )),
//!     TaskConfig::with_id("upper"),
//! )?;
//!
//! let output = workflow.run(None).await?;
//! assert_eq!(output, json!({"text": "HELLO"}));
//! ```
//!
//! ## Module map
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`schema`] | Port descriptors, stream modes, replication hints |
//! | [`task`] | Task lifecycle, handlers, registry, execution context |
//! | [`graph`] | [`TaskGraph`], [`Dataflow`], adjacency, change events |
//! | [`runner`] | Scheduling, streaming propagation, cancellation, cleanup |
//! | [`reactive`] | Cheap recomputation after upstream changes |
//! | [`replicate`] | Array expansion and merge |
//! | [`workflow`] | Builder façade and consolidated events |
//! | [`cache`] | Fingerprint-keyed output cache with singleflight |
//! | [`snapshot`] | Checkpoint save/restore bridges |
//! | [`events`] | Typed pub/sub primitive |
//! | [`fingerprint`] | Canonical-JSON content hashes |
//! | [`retry`] | Exponential backoff policies |
//! | [`stream`] | Stream events, channels, accumulation |
//! | [`runtime`] | Dependency-injected service container |
//! | [`error`] | The engine's error taxonomy |

pub mod cache;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod graph;
pub mod reactive;
pub mod replicate;
pub mod retry;
pub mod runner;
pub mod runtime;
pub mod schema;
pub mod snapshot;
pub mod stream;
pub mod task;
pub mod workflow;

pub use cache::TaskOutputCache;
pub use error::{Result, TaskGraphError};
pub use events::{EventBus, EventSubscription};
pub use fingerprint::{canonicalize, fingerprint, task_cache_key};
pub use graph::{Dataflow, GraphEvent, TaskGraph};
pub use reactive::ReactiveRunner;
pub use replicate::{expand_input, is_array_mode, ArrayExpansion};
pub use retry::RetryPolicy;
pub use runner::{CleanupRegistry, GraphRunner, RunnerConfig};
pub use runtime::{default_container, set_default_container, ServiceContainer};
pub use schema::{
    edge_needs_accumulation, output_stream_mode, port_stream_mode, validate_input, ObjectSchema,
    PortSchema, PortType, StreamMode,
};
pub use snapshot::{restore_graph, save_checkpoint, CheckpointOptions};
pub use stream::{
    stream_channel, text_delta_stream, StreamAccumulator, StreamEvent, StreamReceiver,
    StreamSender, TaskEventStream,
};
pub use task::{
    default_merge, FnTaskHandler, Task, TaskConfig, TaskContext, TaskEvent, TaskHandler,
    TaskRegistry, TaskStatus,
};
pub use workflow::{Workflow, WorkflowEvent};
