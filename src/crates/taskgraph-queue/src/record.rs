//! Durable job records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle status of a queued job
///
/// Per `job_id` the states advance monotonically
/// `PENDING -> PROCESSING -> (COMPLETED | FAILED)`; a retry returns the job to
/// `PENDING` with an incremented attempt count, and `ABORTING` interposes when
/// a cancellation has been requested but not yet observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting to be claimed (or scheduled for a future attempt)
    Pending,
    /// Claimed by exactly one worker
    Processing,
    /// Finished successfully; `output` is valid
    Completed,
    /// Finished with an error (including aborted jobs)
    Failed,
    /// Abort requested; the worker has not yet stopped
    Aborting,
}

impl JobStatus {
    /// Whether the job has reached a final state
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Aborting => "ABORTING",
        };
        write!(f, "{name}")
    }
}

/// One durable job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique job id
    pub id: String,
    /// Queue the job belongs to
    pub queue_name: String,
    /// Current status
    pub status: JobStatus,
    /// Serialized handler input
    pub input: Value,
    /// Handler output, once completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Executions so far (incremented on claim)
    pub attempts: u32,
    /// Attempt budget
    pub max_attempts: u32,
    /// Earliest time the job may be claimed
    pub scheduled_at: DateTime<Utc>,
    /// When the current/last attempt was claimed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Most recent failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Latest reported progress in `[0, 100]`
    ///
    /// Progress of a superseded attempt may arrive late; only the stream
    /// belonging to the latest `started_at` is authoritative.
    #[serde(default)]
    pub progress: f32,
    /// Latest progress message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_message: Option<String>,
}

impl JobRecord {
    /// A fresh `PENDING` job, claimable immediately
    pub fn new(queue_name: impl Into<String>, input: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            queue_name: queue_name.into(),
            status: JobStatus::Pending,
            input,
            output: None,
            attempts: 0,
            max_attempts: 3,
            scheduled_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_error: None,
            progress: 0.0,
            progress_message: None,
        }
    }

    /// Use an explicit id (e.g. a content fingerprint for deduplication)
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the attempt budget
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Defer the first attempt
    pub fn scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = scheduled_at;
        self
    }

    /// Whether the job may still be retried after a failure
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_job_is_claimable() {
        let job = JobRecord::new("default", json!({"n": 1}));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.scheduled_at <= Utc::now());
        assert!(job.has_attempts_remaining());
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Aborting.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
    }

    #[test]
    fn serde_roundtrip() {
        let job = JobRecord::new("q", json!({"k": "v"})).with_max_attempts(5);
        let encoded = serde_json::to_string(&job).unwrap();
        let decoded: JobRecord = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, job.id);
        assert_eq!(decoded.max_attempts, 5);
        assert_eq!(decoded.status, JobStatus::Pending);
    }
}
