//! Client surface: enqueue, wait for completion, abort

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{QueueError, Result};
use crate::record::{JobRecord, JobStatus};
use crate::storage::QueueStorage;

/// Default polling fallback when waiting on a job
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Producer-side handle to one queue
#[derive(Clone)]
pub struct JobQueueClient {
    storage: Arc<dyn QueueStorage>,
    queue_name: String,
}

impl JobQueueClient {
    /// A client for `queue_name`
    pub fn new(storage: Arc<dyn QueueStorage>, queue_name: impl Into<String>) -> Self {
        Self {
            storage,
            queue_name: queue_name.into(),
        }
    }

    /// The queue this client targets
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Enqueue with a generated job id; returns the id
    pub async fn enqueue(&self, input: Value) -> Result<String> {
        self.enqueue_record(JobRecord::new(self.queue_name.clone(), input))
            .await
    }

    /// Enqueue a fully configured record (explicit id, attempts, schedule)
    pub async fn enqueue_record(&self, record: JobRecord) -> Result<String> {
        let job_id = record.id.clone();
        self.storage.enqueue(record).await?;
        debug!(%job_id, queue_name = %self.queue_name, "enqueued job");
        Ok(job_id)
    }

    /// Fetch one job
    pub async fn get(&self, job_id: &str) -> Result<Option<JobRecord>> {
        self.storage.get(job_id).await
    }

    /// Number of non-terminal jobs in the queue
    pub async fn size(&self) -> Result<u64> {
        self.storage.size(&self.queue_name).await
    }

    /// Request an abort; the server observes it mid-flight
    pub async fn abort(&self, job_id: &str) -> Result<()> {
        self.storage.abort(job_id).await
    }

    /// Remove a job outright
    pub async fn delete(&self, job_id: &str) -> Result<()> {
        self.storage.delete(job_id).await
    }

    /// Wait until `job_id` reaches a terminal state
    ///
    /// Backed by the storage subscription with a polling fallback, so it works
    /// against backends without push notifications. `timeout` of `None` waits
    /// indefinitely.
    pub async fn wait_for(&self, job_id: &str, timeout: Option<Duration>) -> Result<JobRecord> {
        let notify = Arc::new(Notify::new());
        let _subscription = {
            let notify = Arc::clone(&notify);
            let job_id = job_id.to_string();
            self.storage.subscribe(
                &self.queue_name,
                Arc::new(move |event| {
                    if event.record.id == job_id && event.record.status.is_terminal() {
                        notify.notify_waiters();
                    }
                }),
            )
        };

        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let record = self
                .storage
                .get(job_id)
                .await?
                .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
            if record.status.is_terminal() {
                return Ok(record);
            }

            let wait = async {
                tokio::select! {
                    _ = notify.notified() => {}
                    _ = tokio::time::sleep(WAIT_POLL_INTERVAL) => {}
                }
            };
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, wait).await.is_err() {
                        return Err(QueueError::Handler(format!(
                            "timed out waiting for job '{job_id}'"
                        )));
                    }
                }
                None => wait.await,
            }
        }
    }
}
