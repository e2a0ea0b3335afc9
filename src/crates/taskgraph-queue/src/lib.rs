//! Durable job queue for the taskgraph engine
//!
//! Long-running or rate-limited work leaves the in-process graph runner and
//! becomes a [`JobRecord`] persisted through [`QueueStorage`]. A
//! [`JobQueueServer`] polls each queue, admits work through a sliding-window
//! [`RateLimiter`] and a semaphore [`ConcurrencyLimiter`], claims one job at a
//! time (at-most-one worker per job, enforced by the storage's transactional
//! claim), executes the registered [`JobHandler`], and transitions the record:
//!
//! ```text
//! PENDING ──claim──▶ PROCESSING ──success──▶ COMPLETED
//!      ▲                 │       ──error───▶ FAILED (attempts exhausted)
//!      └──retry+backoff──┘       ──abort───▶ ABORTING ──▶ FAILED
//! ```
//!
//! The [`JobQueueClient`] side enqueues jobs, waits for terminal states
//! (storage subscription with a polling fallback), and requests aborts that
//! the server observes mid-flight through per-job cancellation tokens.
//!
//! # Quick start
//!
//! ```rust,ignore
//! let storage: Arc<dyn QueueStorage> = Arc::new(InMemoryQueueStorage::new());
//! let server = JobQueueServer::new(
//!     Arc::clone(&storage),
//!     Arc::new(MyHandler),
//!     ServerConfig::new("default"),
//! );
//! let server_handle = tokio::spawn({
//!     let server = Arc::new(server);
//!     let server2 = Arc::clone(&server);
//!     async move { server2.run().await }
//! });
//!
//! let client = JobQueueClient::new(storage, "default");
//! let job_id = client.enqueue(json!({"work": 1})).await?;
//! let record = client.wait_for(&job_id, Some(Duration::from_secs(30))).await?;
//! assert_eq!(record.status, JobStatus::Completed);
//! ```

pub mod client;
pub mod error;
pub mod job;
pub mod limiter;
pub mod memory;
pub mod record;
pub mod server;
pub mod storage;

pub use client::JobQueueClient;
pub use error::{QueueError, Result};
pub use job::{FnJobHandler, JobContext, JobHandler};
pub use limiter::{
    ConcurrencyLimiter, ConcurrencyPermit, RateDecision, RateLimiter, RateLimiterConfig,
};
pub use memory::InMemoryQueueStorage;
pub use record::{JobRecord, JobStatus};
pub use server::{JobQueueServer, ServerConfig};
pub use storage::{QueueEvent, QueueEventKind, QueueListener, QueueStorage};
