//! In-memory implementation of [`QueueStorage`]
//!
//! Jobs live in a `DashMap`; claims serialize through a per-queue mutex so a
//! job is handed to exactly one claimant, matching the linearizable-claim
//! semantics a SQL backend gets from `SELECT ... FOR UPDATE SKIP LOCKED`.
//! Listeners fire synchronously on the mutating thread after the write
//! commits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::trace;

use taskgraph_storage::Subscription;

use crate::error::{QueueError, Result};
use crate::record::{JobRecord, JobStatus};
use crate::storage::{QueueEvent, QueueEventKind, QueueListener, QueueStorage};

struct ListenerEntry {
    queue_name: String,
    listener: QueueListener,
}

/// Process-local queue storage
#[derive(Default)]
pub struct InMemoryQueueStorage {
    jobs: DashMap<String, JobRecord>,
    claim_locks: DashMap<String, Arc<Mutex<()>>>,
    listeners: Arc<Mutex<HashMap<u64, ListenerEntry>>>,
    next_listener_id: AtomicU64,
    /// Optional namespace standing in for SQL prefix columns
    prefix: Option<String>,
}

impl InMemoryQueueStorage {
    /// An empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Partition this instance: queue names are namespaced under `prefix`,
    /// mirroring what prefix columns do in a shared SQL table
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    fn effective_queue(&self, queue_name: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}\u{1f}{queue_name}"),
            None => queue_name.to_string(),
        }
    }

    fn claim_lock(&self, queue: &str) -> Arc<Mutex<()>> {
        self.claim_locks
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn notify(&self, kind: QueueEventKind, record: JobRecord) {
        let queue_name = record.queue_name.clone();
        let snapshot: Vec<QueueListener> = {
            let listeners = self.listeners.lock();
            listeners
                .values()
                .filter(|entry| entry.queue_name == queue_name)
                .map(|entry| Arc::clone(&entry.listener))
                .collect()
        };
        let event = QueueEvent { kind, record };
        for listener in snapshot {
            listener(&event);
        }
    }

    fn update<F>(&self, job_id: &str, mutate: F) -> Result<JobRecord>
    where
        F: FnOnce(&mut JobRecord) -> Result<QueueEventKind>,
    {
        let (kind, record) = {
            let mut entry = self
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
            let kind = mutate(entry.value_mut())?;
            (kind, entry.value().clone())
        };
        self.notify(kind, record.clone());
        Ok(record)
    }

    /// Number of jobs currently stored (tests)
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }
}

#[async_trait]
impl QueueStorage for InMemoryQueueStorage {
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    async fn enqueue(&self, mut record: JobRecord) -> Result<()> {
        record.queue_name = self.effective_queue(&record.queue_name);
        if self.jobs.contains_key(&record.id) {
            return Err(QueueError::Configuration(format!(
                "job id '{}' already enqueued",
                record.id
            )));
        }
        self.jobs.insert(record.id.clone(), record.clone());
        self.notify(QueueEventKind::Enqueued, record);
        Ok(())
    }

    async fn claim_next(&self, queue_name: &str, now: DateTime<Utc>) -> Result<Option<JobRecord>> {
        let queue = self.effective_queue(queue_name);
        let lock = self.claim_lock(&queue);

        // The claim is a read-pick-write; the per-queue mutex makes it atomic
        // against concurrent claimants. Listener callbacks run after the guard
        // drops so they may call back into the storage.
        let claimed = {
            let _guard = lock.lock();
            let candidate = self
                .jobs
                .iter()
                .filter(|entry| {
                    let job = entry.value();
                    job.queue_name == queue
                        && job.status == JobStatus::Pending
                        && job.scheduled_at <= now
                })
                .map(|entry| (entry.value().scheduled_at, entry.key().clone()))
                .min();

            let Some((_, job_id)) = candidate else {
                return Ok(None);
            };

            let mut entry = self
                .jobs
                .get_mut(&job_id)
                .ok_or_else(|| QueueError::JobNotFound(job_id.clone()))?;
            let job = entry.value_mut();
            if job.status != JobStatus::Pending {
                return Err(QueueError::ClaimConflict(job.id.clone()));
            }
            job.status = JobStatus::Processing;
            job.started_at = Some(now);
            job.attempts += 1;
            job.progress = 0.0;
            job.progress_message = None;
            job.clone()
        };

        trace!(job_id = %claimed.id, queue = %queue, attempt = claimed.attempts, "claimed job");
        self.notify(QueueEventKind::Started, claimed.clone());
        Ok(Some(claimed))
    }

    async fn complete(&self, job_id: &str, output: Value) -> Result<()> {
        self.update(job_id, |job| {
            if !matches!(job.status, JobStatus::Processing | JobStatus::Aborting) {
                return Err(QueueError::InvalidState {
                    job_id: job.id.clone(),
                    status: job.status.to_string(),
                    operation: "complete".to_string(),
                });
            }
            job.status = JobStatus::Completed;
            job.output = Some(output);
            job.completed_at = Some(Utc::now());
            job.progress = 100.0;
            Ok(QueueEventKind::Completed)
        })?;
        Ok(())
    }

    async fn fail(
        &self,
        job_id: &str,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.update(job_id, |job| {
            job.last_error = Some(error.to_string());
            match next_attempt_at {
                Some(at) if job.has_attempts_remaining() => {
                    job.status = JobStatus::Pending;
                    job.scheduled_at = at;
                    job.started_at = None;
                }
                _ => {
                    job.status = JobStatus::Failed;
                    job.completed_at = Some(Utc::now());
                }
            }
            Ok(QueueEventKind::Failed)
        })?;
        Ok(())
    }

    async fn set_progress(
        &self,
        job_id: &str,
        progress: f32,
        message: Option<&str>,
    ) -> Result<()> {
        self.update(job_id, |job| {
            job.progress = progress.clamp(0.0, 100.0);
            job.progress_message = message.map(str::to_string);
            Ok(QueueEventKind::Progress)
        })?;
        Ok(())
    }

    async fn abort(&self, job_id: &str) -> Result<()> {
        self.update(job_id, |job| match job.status {
            JobStatus::Pending => {
                job.status = JobStatus::Failed;
                job.last_error = Some("aborted before start".to_string());
                job.completed_at = Some(Utc::now());
                Ok(QueueEventKind::Failed)
            }
            JobStatus::Processing => {
                job.status = JobStatus::Aborting;
                Ok(QueueEventKind::Aborting)
            }
            JobStatus::Aborting => Ok(QueueEventKind::Aborting),
            status => Err(QueueError::InvalidState {
                job_id: job.id.clone(),
                status: status.to_string(),
                operation: "abort".to_string(),
            }),
        })?;
        Ok(())
    }

    async fn delete(&self, job_id: &str) -> Result<()> {
        if let Some((_, record)) = self.jobs.remove(job_id) {
            self.notify(QueueEventKind::Deleted, record);
        }
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>> {
        Ok(self.jobs.get(job_id).map(|entry| entry.value().clone()))
    }

    async fn size(&self, queue_name: &str) -> Result<u64> {
        let queue = self.effective_queue(queue_name);
        Ok(self
            .jobs
            .iter()
            .filter(|entry| {
                entry.value().queue_name == queue && !entry.value().status.is_terminal()
            })
            .count() as u64)
    }

    async fn reclaim_stale(
        &self,
        queue_name: &str,
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let queue = self.effective_queue(queue_name);
        let threshold = now - chrono::Duration::from_std(stale_after).unwrap_or_default();
        let stale: Vec<String> = self
            .jobs
            .iter()
            .filter(|entry| {
                let job = entry.value();
                job.queue_name == queue
                    && job.status == JobStatus::Processing
                    && job.started_at.map(|at| at < threshold).unwrap_or(false)
            })
            .map(|entry| entry.key().clone())
            .collect();

        for job_id in &stale {
            self.update(job_id, |job| {
                job.status = JobStatus::Pending;
                job.started_at = None;
                job.scheduled_at = now;
                job.last_error = Some("claim went stale".to_string());
                Ok(QueueEventKind::Failed)
            })?;
        }
        Ok(stale)
    }

    async fn count_status(&self, queue_name: &str, status: JobStatus) -> Result<u64> {
        let queue = self.effective_queue(queue_name);
        Ok(self
            .jobs
            .iter()
            .filter(|entry| {
                entry.value().queue_name == queue && entry.value().status == status
            })
            .count() as u64)
    }

    fn subscribe(&self, queue_name: &str, listener: QueueListener) -> Subscription {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(
            id,
            ListenerEntry {
                queue_name: self.effective_queue(queue_name),
                listener,
            },
        );
        let listeners = Arc::clone(&self.listeners);
        Subscription::new(move || {
            listeners.lock().remove(&id);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn claim_is_exclusive_and_ordered() {
        let storage = InMemoryQueueStorage::new();
        let early = JobRecord::new("q", json!(1)).scheduled_at(Utc::now() - chrono::Duration::seconds(10));
        let early_id = early.id.clone();
        storage.enqueue(early).await.unwrap();
        storage.enqueue(JobRecord::new("q", json!(2))).await.unwrap();

        let first = storage.claim_next("q", Utc::now()).await.unwrap().unwrap();
        assert_eq!(first.id, early_id);
        assert_eq!(first.status, JobStatus::Processing);
        assert_eq!(first.attempts, 1);

        let second = storage.claim_next("q", Utc::now()).await.unwrap().unwrap();
        assert_ne!(second.id, first.id);
        assert!(storage.claim_next("q", Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scheduled_jobs_wait_their_turn() {
        let storage = InMemoryQueueStorage::new();
        let future = Utc::now() + chrono::Duration::seconds(60);
        storage
            .enqueue(JobRecord::new("q", json!(1)).scheduled_at(future))
            .await
            .unwrap();
        assert!(storage.claim_next("q", Utc::now()).await.unwrap().is_none());
        assert!(storage
            .claim_next("q", future + chrono::Duration::seconds(1))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn fail_with_retry_requeues() {
        let storage = InMemoryQueueStorage::new();
        let job = JobRecord::new("q", json!(1)).with_max_attempts(2);
        let job_id = job.id.clone();
        storage.enqueue(job).await.unwrap();

        storage.claim_next("q", Utc::now()).await.unwrap().unwrap();
        let next = Utc::now() + chrono::Duration::milliseconds(10);
        storage.fail(&job_id, "boom", Some(next)).await.unwrap();

        let requeued = storage.get(&job_id).await.unwrap().unwrap();
        assert_eq!(requeued.status, JobStatus::Pending);
        assert_eq!(requeued.attempts, 1);
        assert_eq!(requeued.last_error.as_deref(), Some("boom"));

        // Second failure exhausts the budget.
        storage
            .claim_next("q", next + chrono::Duration::seconds(1))
            .await
            .unwrap()
            .unwrap();
        storage
            .fail(&job_id, "boom again", Some(Utc::now()))
            .await
            .unwrap();
        let failed = storage.get(&job_id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn abort_paths() {
        let storage = InMemoryQueueStorage::new();
        let pending = JobRecord::new("q", json!(1));
        let pending_id = pending.id.clone();
        storage.enqueue(pending).await.unwrap();
        storage.abort(&pending_id).await.unwrap();
        assert_eq!(
            storage.get(&pending_id).await.unwrap().unwrap().status,
            JobStatus::Failed
        );

        let active = JobRecord::new("q", json!(2));
        let active_id = active.id.clone();
        storage.enqueue(active).await.unwrap();
        storage.claim_next("q", Utc::now()).await.unwrap().unwrap();
        storage.abort(&active_id).await.unwrap();
        assert_eq!(
            storage.get(&active_id).await.unwrap().unwrap().status,
            JobStatus::Aborting
        );
    }

    #[tokio::test]
    async fn prefix_partitions_queues() {
        let tenant_a = InMemoryQueueStorage::new().with_prefix("tenant-a");
        tenant_a.enqueue(JobRecord::new("q", json!(1))).await.unwrap();
        assert_eq!(tenant_a.size("q").await.unwrap(), 1);

        let claimed = tenant_a.claim_next("q", Utc::now()).await.unwrap();
        assert!(claimed.is_some());
    }

    #[tokio::test]
    async fn reclaim_stale_requeues_dead_claims() {
        let storage = InMemoryQueueStorage::new();
        let job = JobRecord::new("q", json!(1)).with_max_attempts(3);
        let job_id = job.id.clone();
        storage.enqueue(job).await.unwrap();
        storage.claim_next("q", Utc::now()).await.unwrap().unwrap();

        let later = Utc::now() + chrono::Duration::seconds(120);
        let reclaimed = storage
            .reclaim_stale("q", Duration::from_secs(60), later)
            .await
            .unwrap();
        assert_eq!(reclaimed, vec![job_id.clone()]);
        assert_eq!(
            storage.get(&job_id).await.unwrap().unwrap().status,
            JobStatus::Pending
        );
    }

    #[tokio::test]
    async fn subscription_sees_lifecycle() {
        let storage = InMemoryQueueStorage::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let subscription = {
            let seen = Arc::clone(&seen);
            storage.subscribe(
                "q",
                Arc::new(move |event: &QueueEvent| {
                    seen.lock().push(event.kind);
                }),
            )
        };

        let job = JobRecord::new("q", json!(1));
        let job_id = job.id.clone();
        storage.enqueue(job).await.unwrap();
        storage.claim_next("q", Utc::now()).await.unwrap().unwrap();
        storage.complete(&job_id, json!("done")).await.unwrap();

        assert_eq!(
            *seen.lock(),
            vec![
                QueueEventKind::Enqueued,
                QueueEventKind::Started,
                QueueEventKind::Completed
            ]
        );
        subscription.unsubscribe();
    }
}
