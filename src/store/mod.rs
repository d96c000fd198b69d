//! Durable job queue.
//!
//! [`JobStore`] is the single synchronization point across the fleet: its
//! claim operation is atomic at the store level, so any number of consumers
//! (in any number of processes) can call [`JobStore::claim_next`] without
//! two of them ever receiving the same job.
//!
//! Two backends implement it:
//! - [`PostgresJobStore`]: production backend, row-level locking with
//!   `FOR UPDATE SKIP LOCKED`.
//! - [`MemoryJobStore`]: same semantics behind a mutex, with a fault switch
//!   for exercising the transient-error paths.

pub mod job;
pub mod memory;
pub mod migrations;
pub mod postgres;
pub mod schema;

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;

pub use job::{
    Job, JobStatus, NewJob, ReclaimReport, RetryOutcome, StoreStats, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_QUEUE,
};
pub use memory::MemoryJobStore;
pub use migrations::{AppliedMigration, MigrationRunner};
pub use postgres::PostgresJobStore;

/// Transactional job queue with scheduling, leasing and bounded retries.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a pending job and returns its id.
    async fn enqueue(&self, job: NewJob) -> Result<Uuid, StoreError>;

    /// Atomically moves up to `limit` due pending jobs of `queue` to
    /// `claimed` and returns them, oldest `scheduled_at` first.
    async fn claim_next(&self, queue: &str, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Marks a claimed job succeeded. Acking an unknown or already settled
    /// job is a no-op.
    async fn ack(&self, job_id: Uuid) -> Result<(), StoreError>;

    /// Records a failed execution: increments `attempts`, then either
    /// reschedules the job `backoff` from now or fails it for good once
    /// `attempts` reaches `max_attempts`.
    async fn retry(
        &self,
        job_id: Uuid,
        backoff: Duration,
        reason: &str,
    ) -> Result<RetryOutcome, StoreError>;

    /// Fails a claimed job without retry. Returns whether the job changed.
    async fn fail(&self, job_id: Uuid, reason: &str) -> Result<bool, StoreError>;

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Most recently failed jobs of `queue`, newest first.
    async fn failed_jobs(&self, queue: &str, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Treats jobs claimed longer than `older_than` ago as crashed: each
    /// counts as a failed attempt and goes back to pending (due now) or to
    /// failed when exhausted.
    async fn reclaim_stale(
        &self,
        queue: &str,
        older_than: Duration,
    ) -> Result<ReclaimReport, StoreError>;

    async fn stats(&self, queue: &str) -> Result<StoreStats, StoreError>;
}

/// Message recorded as `last_error` for jobs recovered by the sweep.
pub(crate) const STALE_CLAIM_REASON: &str = "claim went stale; execution unit presumed lost";
