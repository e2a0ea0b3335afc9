//! The per-queue server loop
//!
//! One [`JobQueueServer`] polls one queue name:
//!
//! 1. wait for a concurrency slot;
//! 2. consult the rate limiter - on deny, sleep `retry_after` and loop;
//! 3. claim the next due job - on none, sleep the poll interval and loop
//!    (claim conflicts retry with jitter);
//! 4. spawn the attempt: build a [`JobContext`] with a per-job cancellation
//!    token, invoke the handler, then `complete` or `fail` with backoff while
//!    attempts remain;
//! 5. on every path release the slot, record the execution with the rate
//!    limiter, and drop the job's token.
//!
//! Aborts arrive through the storage subscription: when a client moves an
//! active job to `ABORTING`, the server cancels that job's token and the
//! handler winds down cooperatively.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use taskgraph_core::retry::RetryPolicy;

use crate::error::{QueueError, Result};
use crate::job::{JobContext, JobHandler};
use crate::limiter::{ConcurrencyLimiter, RateLimiter};
use crate::record::JobRecord;
use crate::storage::{QueueEventKind, QueueStorage};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Queue this server drains
    pub queue_name: String,
    /// Sleep between empty polls
    pub poll_interval: Duration,
    /// Maximum jitter added when a claim conflicts
    pub claim_jitter: Duration,
    /// Backoff schedule for retried attempts
    pub retry: RetryPolicy,
    /// In-flight cap
    pub concurrency: usize,
    /// Requeue `PROCESSING` jobs older than this (dead workers)
    pub stale_after: Option<Duration>,
}

impl ServerConfig {
    /// Defaults for one queue: 100 ms poll, exponential retry, 4 in flight
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            poll_interval: Duration::from_millis(100),
            claim_jitter: Duration::from_millis(50),
            retry: RetryPolicy::exponential(),
            concurrency: 4,
            stale_after: None,
        }
    }

    /// Set the empty-poll sleep
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the retry schedule
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the in-flight cap
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Enable stale-claim reclamation
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = Some(stale_after);
        self
    }
}

/// Long-running worker loop for one queue
pub struct JobQueueServer {
    storage: Arc<dyn QueueStorage>,
    handler: Arc<dyn JobHandler>,
    rate: Option<Arc<RateLimiter>>,
    concurrency: ConcurrencyLimiter,
    config: ServerConfig,
    shutdown: CancellationToken,
    active: Arc<DashMap<String, CancellationToken>>,
}

impl JobQueueServer {
    /// A server without a rate limiter
    pub fn new(
        storage: Arc<dyn QueueStorage>,
        handler: Arc<dyn JobHandler>,
        config: ServerConfig,
    ) -> Self {
        Self {
            concurrency: ConcurrencyLimiter::new(config.concurrency),
            storage,
            handler,
            rate: None,
            config,
            shutdown: CancellationToken::new(),
            active: Arc::new(DashMap::new()),
        }
    }

    /// Gate claims through a rate limiter
    pub fn with_rate_limiter(mut self, rate: Arc<RateLimiter>) -> Self {
        self.rate = Some(rate);
        self
    }

    /// Token that stops the loop when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Request a graceful stop: no new claims; in-flight attempts finish
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Jobs currently executing on this server
    pub fn active_jobs(&self) -> usize {
        self.active.len()
    }

    /// Run until shutdown
    #[instrument(skip_all, fields(queue_name = %self.config.queue_name))]
    pub async fn run(self: Arc<Self>) -> Result<()> {
        // Observe aborts: a job moving to ABORTING cancels its active token.
        let active = Arc::clone(&self.active);
        let abort_watch = self.storage.subscribe(
            &self.config.queue_name,
            Arc::new(move |event| {
                if event.kind == QueueEventKind::Aborting {
                    if let Some(token) = active.get(&event.record.id) {
                        token.cancel();
                    }
                }
            }),
        );

        let mut attempts: tokio::task::JoinSet<()> = tokio::task::JoinSet::new();
        let mut last_reclaim = tokio::time::Instant::now();

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            // Opportunistic stale-claim sweep.
            if let Some(stale_after) = self.config.stale_after {
                if last_reclaim.elapsed() >= stale_after {
                    last_reclaim = tokio::time::Instant::now();
                    match self
                        .storage
                        .reclaim_stale(&self.config.queue_name, stale_after, Utc::now())
                        .await
                    {
                        Ok(reclaimed) if !reclaimed.is_empty() => {
                            warn!(count = reclaimed.len(), "requeued stale claims");
                        }
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "stale reclaim failed"),
                    }
                }
            }

            // 1. Capacity.
            let permit = match self.concurrency.acquire(&self.shutdown).await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            // 2. Rate.
            if let Some(rate) = &self.rate {
                match rate.check(&self.config.queue_name).await {
                    Ok(decision) if !decision.allowed => {
                        drop(permit);
                        let wait = decision.retry_after.unwrap_or(self.config.poll_interval);
                        self.sleep(wait).await;
                        continue;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        drop(permit);
                        warn!(error = %err, "rate check failed, backing off");
                        self.sleep(self.config.poll_interval).await;
                        continue;
                    }
                }
            }

            // 3. Claim.
            let job = match self
                .storage
                .claim_next(&self.config.queue_name, Utc::now())
                .await
            {
                Ok(Some(job)) => job,
                Ok(None) => {
                    drop(permit);
                    self.sleep(self.config.poll_interval).await;
                    continue;
                }
                Err(err) if err.is_transient() => {
                    drop(permit);
                    let jitter = rand::thread_rng()
                        .gen_range(Duration::ZERO..=self.config.claim_jitter.max(Duration::from_millis(1)));
                    debug!(error = %err, "claim conflict, retrying with jitter");
                    self.sleep(jitter).await;
                    continue;
                }
                Err(err) => {
                    drop(permit);
                    return Err(err);
                }
            };

            // 4. Execute; the spawned attempt owns the permit.
            let server = Arc::clone(&self);
            attempts.spawn(async move {
                server.run_attempt(job).await;
                drop(permit);
            });

            // Reap finished attempts without blocking the loop.
            while attempts.try_join_next().is_some() {}
        }

        // Graceful drain.
        while attempts.join_next().await.is_some() {}
        abort_watch.unsubscribe();
        Ok(())
    }

    /// One claimed attempt: execute, settle, record
    async fn run_attempt(&self, job: JobRecord) {
        let token = self.shutdown.child_token();
        self.active.insert(job.id.clone(), token.clone());

        let ctx = JobContext::new(
            job.id.clone(),
            job.queue_name.clone(),
            Arc::clone(&self.storage),
            token.clone(),
        );
        let outcome = self.handler.execute(job.input.clone(), ctx).await;
        self.settle(&job, outcome).await;

        if let Some(rate) = &self.rate {
            if let Err(err) = rate.record_execution(&self.config.queue_name).await {
                warn!(job_id = %job.id, error = %err, "failed to record execution");
            }
        }
        self.active.remove(&job.id);
        token.cancel();
    }

    /// Transition the record after an attempt
    async fn settle(&self, job: &JobRecord, outcome: Result<Value>) {
        match outcome {
            Ok(output) => {
                if let Err(err) = self.storage.complete(&job.id, output).await {
                    warn!(job_id = %job.id, error = %err, "failed to mark job completed");
                }
            }
            Err(err) => {
                let retryable =
                    err.is_transient() && self.config.retry.should_retry(job.attempts);
                let next_attempt_at = retryable.then(|| {
                    // attempts was already incremented by the claim.
                    Utc::now()
                        + chrono::Duration::from_std(
                            self.config.retry.delay_for_attempt(job.attempts + 1),
                        )
                        .unwrap_or_else(|_| chrono::Duration::seconds(1))
                });
                debug!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    retryable,
                    error = %err,
                    "attempt failed"
                );
                if let Err(store_err) = self
                    .storage
                    .fail(&job.id, &err.to_string(), next_attempt_at)
                    .await
                {
                    warn!(job_id = %job.id, error = %store_err, "failed to record job failure");
                }
            }
        }
    }

    async fn sleep(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }
}
