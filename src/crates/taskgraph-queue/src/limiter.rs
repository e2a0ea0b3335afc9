//! Rate and concurrency limiting
//!
//! Two gates compose in front of every claim:
//!
//! - [`RateLimiter`] - a sliding window over durable execution records: at
//!   most `max_executions` admissions in any trailing `window`. Both reads and
//!   writes go through [`TabularStorage`] tables (shared across processes),
//!   with optional prefix columns partitioning tenants. A `next_available_at`
//!   cell caches the earliest possible admission so denied checks are cheap.
//! - [`ConcurrencyLimiter`] - a semaphore bounding in-flight executions.
//!   Acquisition is cancel-safe and permits release on drop, so every exit
//!   path (success, failure, abort) frees the slot.
//!
//! Under `k` concurrent workers the window count may momentarily overshoot by
//! at most `k - 1`; deployments needing a strict cap set `max_executions`
//! accordingly.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::trace;
use uuid::Uuid;

use taskgraph_storage::{Key, TableSchema, TabularStorage};

use crate::error::{QueueError, Result};

/// Table name of the execution-record table
pub const RATE_EXECUTIONS_TABLE: &str = "rate_limit_executions";
/// Table name of the next-available cache table
pub const RATE_NEXT_AVAILABLE_TABLE: &str = "rate_limit_next_available";

/// Outcome of a rate check
#[derive(Debug, Clone, PartialEq)]
pub struct RateDecision {
    /// Whether the caller may proceed
    pub allowed: bool,
    /// How long to wait before trying again, when denied
    pub retry_after: Option<Duration>,
}

impl RateDecision {
    fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after: None,
        }
    }

    fn denied(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after: Some(retry_after),
        }
    }
}

/// Configuration of a [`RateLimiter`]
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Maximum admissions per sliding window
    pub max_executions: u32,
    /// Window length
    pub window: Duration,
    /// Static prefix columns joined into every row and predicate
    pub prefix: Vec<(String, Value)>,
}

impl RateLimiterConfig {
    /// `max_executions` per `window`, no prefix
    pub fn new(max_executions: u32, window: Duration) -> Self {
        Self {
            max_executions: max_executions.max(1),
            window,
            prefix: Vec::new(),
        }
    }

    /// Add a prefix column
    pub fn with_prefix(mut self, column: impl Into<String>, value: Value) -> Self {
        self.prefix.push((column.into(), value));
        self
    }
}

/// Sliding-window admission gate per queue
pub struct RateLimiter {
    executions: Arc<dyn TabularStorage>,
    next_available: Arc<dyn TabularStorage>,
    config: RateLimiterConfig,
}

impl RateLimiter {
    /// Wrap tables created with [`RateLimiter::executions_schema`] /
    /// [`RateLimiter::next_available_schema`] (built with the same prefix
    /// columns as `config`)
    pub fn new(
        executions: Arc<dyn TabularStorage>,
        next_available: Arc<dyn TabularStorage>,
        config: RateLimiterConfig,
    ) -> Self {
        Self {
            executions,
            next_available,
            config,
        }
    }

    /// Schema of the execution-record table
    pub fn executions_schema(prefix_columns: &[&str]) -> TableSchema {
        let mut columns: Vec<String> = prefix_columns.iter().map(|c| c.to_string()).collect();
        columns.extend(["queue_name", "executed_at", "id"].map(String::from));
        let mut index: Vec<String> = prefix_columns.iter().map(|c| c.to_string()).collect();
        index.push("queue_name".to_string());
        TableSchema::new(RATE_EXECUTIONS_TABLE)
            .with_columns(columns)
            .with_primary_key(["id"])
            .with_index(index)
    }

    /// Schema of the next-available table (PK `(prefix..., queue_name)`)
    pub fn next_available_schema(prefix_columns: &[&str]) -> TableSchema {
        let mut columns: Vec<String> = prefix_columns.iter().map(|c| c.to_string()).collect();
        columns.extend(["queue_name", "next_available_at"].map(String::from));
        let mut pk: Vec<String> = prefix_columns.iter().map(|c| c.to_string()).collect();
        pk.push("queue_name".to_string());
        TableSchema::new(RATE_NEXT_AVAILABLE_TABLE)
            .with_columns(columns)
            .with_primary_key(pk)
    }

    fn prefixed_key(&self, queue_name: &str) -> Key {
        let mut key = Key::new();
        for (column, value) in &self.config.prefix {
            key = key.with(column.clone(), value.clone());
        }
        key.with("queue_name", json!(queue_name))
    }

    /// May one more execution be admitted for `queue_name` right now?
    pub async fn check(&self, queue_name: &str) -> Result<RateDecision> {
        let now = Utc::now();

        // Cached upper bound first.
        if let Some(row) = self.next_available.get(&self.prefixed_key(queue_name)).await? {
            if let Some(next) = parse_time(row.get("next_available_at")) {
                if next > now {
                    let retry_after = (next - now).to_std().unwrap_or(Duration::ZERO);
                    return Ok(RateDecision::denied(retry_after));
                }
            }
        }

        let window = chrono::Duration::from_std(self.config.window)
            .map_err(|e| QueueError::Configuration(format!("window too large: {e}")))?;
        let window_start = now - window;

        let rows = self.executions.search(&self.prefixed_key(queue_name)).await?;
        let mut in_window: Vec<DateTime<Utc>> = Vec::new();
        for row in &rows {
            match parse_time(row.get("executed_at")) {
                Some(at) if at > window_start => in_window.push(at),
                Some(_) => {
                    // Expired record; prune opportunistically.
                    if let Some(id) = row.get("id") {
                        self.executions
                            .delete(&Key::new().with("id", id.clone()))
                            .await
                            .ok();
                    }
                }
                None => {}
            }
        }

        if (in_window.len() as u32) < self.config.max_executions {
            trace!(queue_name, in_window = in_window.len(), "rate check allowed");
            return Ok(RateDecision::allowed());
        }

        let oldest = in_window.iter().min().copied().unwrap_or(now);
        let next = oldest + window;
        let retry_after = (next - now).to_std().unwrap_or(Duration::ZERO);

        let mut row = serde_json::Map::new();
        for (column, value) in &self.config.prefix {
            row.insert(column.clone(), value.clone());
        }
        row.insert("queue_name".to_string(), json!(queue_name));
        row.insert("next_available_at".to_string(), json!(next.to_rfc3339()));
        self.next_available.put(Value::Object(row)).await?;

        trace!(queue_name, retry_after_ms = retry_after.as_millis() as u64, "rate check denied");
        Ok(RateDecision::denied(retry_after))
    }

    /// Record one admitted execution
    pub async fn record_execution(&self, queue_name: &str) -> Result<()> {
        let mut row = serde_json::Map::new();
        for (column, value) in &self.config.prefix {
            row.insert(column.clone(), value.clone());
        }
        row.insert("queue_name".to_string(), json!(queue_name));
        row.insert("executed_at".to_string(), json!(Utc::now().to_rfc3339()));
        row.insert("id".to_string(), json!(Uuid::new_v4().to_string()));
        self.executions.put(Value::Object(row)).await?;
        Ok(())
    }
}

fn parse_time(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value?.as_str()?.parse().ok()
}

/// RAII permit of a [`ConcurrencyLimiter`]; dropping releases the slot
pub struct ConcurrencyPermit {
    _permit: OwnedSemaphorePermit,
}

/// Semaphore bounding in-flight executions
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ConcurrencyLimiter {
    /// A limiter admitting `capacity` concurrent holders
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a slot, aborting cleanly if `token` fires first
    pub async fn acquire(&self, token: &CancellationToken) -> Result<ConcurrencyPermit> {
        tokio::select! {
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                let permit = permit
                    .map_err(|_| QueueError::Configuration("limiter semaphore closed".into()))?;
                Ok(ConcurrencyPermit { _permit: permit })
            }
            _ = token.cancelled() => Err(QueueError::Cancelled { job_id: None }),
        }
    }
}
