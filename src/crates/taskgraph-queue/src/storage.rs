//! The queue storage contract
//!
//! Implementations persist [`JobRecord`]s and enforce the queue's central
//! invariant: **at most one worker holds a job in `PROCESSING`**. SQL backends
//! realize [`QueueStorage::claim_next`] with `SELECT ... FOR UPDATE SKIP
//! LOCKED`; the in-memory backend compare-and-sets under a per-queue lock.
//! Either way the claim must be linearizable per queue.
//!
//! Backends that partition one physical table across tenants do so with
//! *prefix columns*: static `(column, value)` pairs configured per storage
//! instance that join every read and write predicate. The in-memory backend
//! namespaces queue names instead; the observable behavior is identical.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use taskgraph_storage::Subscription;

use crate::error::Result;
use crate::record::{JobRecord, JobStatus};

/// What happened to a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEventKind {
    /// Inserted as `PENDING`
    Enqueued,
    /// Claimed into `PROCESSING`
    Started,
    /// Progress updated
    Progress,
    /// Completed successfully
    Completed,
    /// Failed (terminal) or returned to `PENDING` for retry
    Failed,
    /// Abort requested
    Aborting,
    /// Removed
    Deleted,
}

/// Notification emitted after a job mutation commits
#[derive(Debug, Clone)]
pub struct QueueEvent {
    /// What happened
    pub kind: QueueEventKind,
    /// The job's state after the mutation
    pub record: JobRecord,
}

/// Callback invoked for every event on a subscribed queue
pub type QueueListener = Arc<dyn Fn(&QueueEvent) + Send + Sync>;

/// Durable storage for job records
///
/// All operations may fail transiently ([`QueueError::Storage`]); the server
/// loop backs off and continues. Claim conflicts surface as
/// [`QueueError::ClaimConflict`] and are retried with jitter by the caller.
///
/// [`QueueError::Storage`]: crate::error::QueueError::Storage
/// [`QueueError::ClaimConflict`]: crate::error::QueueError::ClaimConflict
#[async_trait]
pub trait QueueStorage: Send + Sync {
    /// Create backing structures. Idempotent.
    async fn setup(&self) -> Result<()>;

    /// Insert a `PENDING` job
    async fn enqueue(&self, record: JobRecord) -> Result<()>;

    /// Atomically claim one due job of `queue_name`
    ///
    /// Selects a `PENDING` job with `scheduled_at <= now` (earliest first),
    /// marks it `PROCESSING` with `started_at = now` and an incremented
    /// attempt count, and returns it. `None` when nothing is due.
    async fn claim_next(&self, queue_name: &str, now: DateTime<Utc>) -> Result<Option<JobRecord>>;

    /// Transition a `PROCESSING`/`ABORTING` job to `COMPLETED`
    async fn complete(&self, job_id: &str, output: Value) -> Result<()>;

    /// Record a failure
    ///
    /// With `next_attempt_at` and attempts remaining the job returns to
    /// `PENDING` scheduled for that time; otherwise it becomes `FAILED`.
    async fn fail(
        &self,
        job_id: &str,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Persist a progress report
    async fn set_progress(&self, job_id: &str, progress: f32, message: Option<&str>)
        -> Result<()>;

    /// Request an abort
    ///
    /// A `PENDING` job fails immediately; a `PROCESSING` job moves to
    /// `ABORTING` for the server to observe.
    async fn abort(&self, job_id: &str) -> Result<()>;

    /// Remove a job outright
    async fn delete(&self, job_id: &str) -> Result<()>;

    /// Fetch one job
    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>>;

    /// Number of non-terminal jobs in a queue
    async fn size(&self, queue_name: &str) -> Result<u64>;

    /// Requeue `PROCESSING` jobs whose claim went stale (worker died)
    ///
    /// A job is stale when `started_at` is older than `stale_after`. Returns
    /// the requeued job ids.
    async fn reclaim_stale(
        &self,
        queue_name: &str,
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let _ = (queue_name, stale_after, now);
        Ok(Vec::new())
    }

    /// Count jobs of a queue in one status (monitoring)
    async fn count_status(&self, queue_name: &str, status: JobStatus) -> Result<u64>;

    /// Register a listener for one queue's events
    fn subscribe(&self, queue_name: &str, listener: QueueListener) -> Subscription;
}
