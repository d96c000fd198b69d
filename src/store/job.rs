//! Job model for the durable queue.
//!
//! - `Job`: a persisted unit of work as read back from the store
//! - `NewJob`: what a producer hands to `enqueue`
//! - `JobStatus`: `pending | claimed | succeeded | failed`
//! - `RetryOutcome`, `ReclaimReport`, `StoreStats`: results of store operations

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default ceiling on executions of a single job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Queue used when a producer does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for `scheduled_at` to pass and a consumer to claim it.
    Pending,
    /// Leased by exactly one consumer.
    Claimed,
    /// Acked; terminal.
    Succeeded,
    /// Attempts exhausted or non-retryable failure; terminal.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Claimed => "claimed",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "claimed" => Ok(JobStatus::Claimed),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// A job as persisted by the store.
///
/// The orchestrator only ever holds a working copy of a claimed job; the
/// store remains the owner of its state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    /// Selects the plugin that runs this job.
    pub task_kind: String,
    /// Opaque JSON handed to the plugin.
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Failed executions so far. Never exceeds `max_attempts`.
    pub attempts: u32,
    pub max_attempts: u32,
    /// The job must not be claimed before this instant.
    pub scheduled_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether a failure of the current execution would exhaust the job.
    pub fn is_last_attempt(&self) -> bool {
        self.attempts + 1 >= self.max_attempts
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    /// How long the job waited between becoming due and being claimed.
    pub fn claim_latency(&self) -> Option<chrono::Duration> {
        self.claimed_at.map(|claimed| claimed - self.scheduled_at)
    }
}

/// A job to enqueue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub queue: String,
    pub task_kind: String,
    pub payload: serde_json::Value,
    /// `None` means due immediately.
    pub not_before: Option<DateTime<Utc>>,
    pub max_attempts: u32,
}

impl NewJob {
    pub fn new(task_kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            task_kind: task_kind.into(),
            payload,
            not_before: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    /// Schedules the job `delay` from now.
    pub fn with_delay(self, delay: Duration) -> Self {
        let delay = chrono::Duration::from_std(delay)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let at = Utc::now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.not_before(at)
    }

    /// Sets the attempt ceiling; values below 1 are raised to 1.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

/// Result of [`JobStore::retry`](super::JobStore::retry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Back to pending, due at `at`.
    Rescheduled { at: DateTime<Utc>, attempts: u32 },
    /// Attempts exhausted; the job is now terminally failed.
    Exhausted { attempts: u32 },
    /// The job was not claimed (already settled, or unknown); nothing changed.
    NotClaimed,
}

/// Result of a stale-claim sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub requeued: u64,
    pub failed: u64,
}

impl ReclaimReport {
    pub fn total(&self) -> u64 {
        self.requeued + self.failed
    }
}

/// Per-status job counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub pending: u64,
    pub claimed: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl StoreStats {
    pub fn total(&self) -> u64 {
        self.pending + self.claimed + self.succeeded + self.failed
    }

    pub(crate) fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Claimed => self.claimed += count,
            JobStatus::Succeeded => self.succeeded += count,
            JobStatus::Failed => self.failed += count,
        }
    }
}
