//! Job handlers and their execution context

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{QueueError, Result};
use crate::storage::QueueStorage;

/// Behavior of the jobs on one queue
///
/// Handlers must observe [`JobContext::token`]; a pending abort otherwise
/// only takes effect when the attempt finishes on its own. Failures returned
/// as [`QueueError::Handler`] or [`QueueError::Storage`] are retried with
/// backoff while attempts remain; [`QueueError::Configuration`] and
/// [`QueueError::Cancelled`] are terminal.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute one attempt
    async fn execute(&self, input: Value, ctx: JobContext) -> Result<Value>;
}

/// Per-attempt context handed to a [`JobHandler`]
#[derive(Clone)]
pub struct JobContext {
    job_id: String,
    queue_name: String,
    storage: Arc<dyn QueueStorage>,
    token: CancellationToken,
}

impl JobContext {
    /// Build a context for one attempt
    pub fn new(
        job_id: impl Into<String>,
        queue_name: impl Into<String>,
        storage: Arc<dyn QueueStorage>,
        token: CancellationToken,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            queue_name: queue_name.into(),
            storage,
            token,
        }
    }

    /// Id of the executing job
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Queue the job belongs to
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Cancellation signal for this attempt
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether an abort was requested
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Error out if an abort was requested
    pub fn check_cancelled(&self) -> Result<()> {
        if self.token.is_cancelled() {
            Err(QueueError::Cancelled {
                job_id: Some(self.job_id.clone()),
            })
        } else {
            Ok(())
        }
    }

    /// Persist a progress report for this attempt
    pub async fn update_progress(&self, progress: f32, message: Option<&str>) -> Result<()> {
        self.storage
            .set_progress(&self.job_id, progress, message)
            .await
    }
}

/// Closure-backed [`JobHandler`] for tests and simple queues
pub struct FnJobHandler<F> {
    execute: F,
}

impl<F, Fut> FnJobHandler<F>
where
    F: Fn(Value, JobContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value>> + Send,
{
    /// Wrap a closure as a handler
    pub fn new(execute: F) -> Self {
        Self { execute }
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnJobHandler<F>
where
    F: Fn(Value, JobContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value>> + Send,
{
    async fn execute(&self, input: Value, ctx: JobContext) -> Result<Value> {
        (self.execute)(input, ctx).await
    }
}
