//! In-memory job store.
//!
//! Same semantics as [`PostgresJobStore`](super::PostgresJobStore), with the
//! whole table behind one mutex so every operation is atomic. Used by tests
//! and by single-process deployments that do not need durability.
//!
//! [`MemoryJobStore::set_unavailable`] makes every operation fail with
//! [`StoreError::Unavailable`], which is how the transient-error paths of the
//! orchestrator are exercised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::StoreError;

use super::job::{Job, JobStatus, NewJob, ReclaimReport, RetryOutcome, StoreStats};
use super::{JobStore, STALE_CLAIM_REASON};

/// Cloneable handle to a shared in-memory job table.
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    jobs: Arc<Mutex<HashMap<Uuid, Job>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggles the simulated outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Copies of every job, in no particular order.
    pub fn snapshot(&self) -> Vec<Job> {
        match self.jobs.lock() {
            Ok(jobs) => jobs.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        }
    }

    /// Makes a pending job due immediately, skipping its backoff.
    pub fn make_due(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let mut jobs = self.table()?;
        match jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.scheduled_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Pretends a claim happened `age` ago, so the stale sweep picks it up.
    pub fn backdate_claim(&self, job_id: Uuid, age: Duration) -> Result<bool, StoreError> {
        let mut jobs = self.table()?;
        match jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Claimed => {
                let age = chrono::Duration::from_std(age)
                    .map_err(|e| StoreError::Query(e.to_string()))?;
                job.claimed_at = Some(Utc::now() - age);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn table(&self) -> Result<MutexGuard<'_, HashMap<Uuid, Job>>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        self.jobs
            .lock()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".to_string()))
    }
}

/// Shared failure transition of `retry` and `reclaim_stale`.
fn record_failed_attempt(job: &mut Job, backoff: chrono::Duration, reason: &str) -> JobStatus {
    let now = Utc::now();
    job.attempts += 1;
    job.claimed_at = None;
    job.last_error = Some(reason.to_string());
    job.updated_at = now;
    if job.attempts >= job.max_attempts {
        job.status = JobStatus::Failed;
        job.finished_at = Some(now);
    } else {
        job.status = JobStatus::Pending;
        job.scheduled_at = now + backoff;
    }
    job.status
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, new: NewJob) -> Result<Uuid, StoreError> {
        let mut jobs = self.table()?;
        let now = Utc::now();
        let id = Uuid::new_v4();
        jobs.insert(
            id,
            Job {
                id,
                queue: new.queue,
                task_kind: new.task_kind,
                payload: new.payload,
                status: JobStatus::Pending,
                attempts: 0,
                max_attempts: new.max_attempts.max(1),
                scheduled_at: new.not_before.unwrap_or(now),
                last_error: None,
                created_at: now,
                updated_at: now,
                claimed_at: None,
                finished_at: None,
            },
        );
        Ok(id)
    }

    async fn claim_next(&self, queue: &str, limit: usize) -> Result<Vec<Job>, StoreError> {
        let mut jobs = self.table()?;
        let now = Utc::now();

        let mut due: Vec<&mut Job> = jobs
            .values_mut()
            .filter(|job| {
                job.queue == queue && job.status == JobStatus::Pending && job.scheduled_at <= now
            })
            .collect();
        due.sort_by(|a, b| {
            a.scheduled_at
                .cmp(&b.scheduled_at)
                .then(a.created_at.cmp(&b.created_at))
        });

        Ok(due
            .into_iter()
            .take(limit)
            .map(|job| {
                job.status = JobStatus::Claimed;
                job.claimed_at = Some(now);
                job.updated_at = now;
                job.clone()
            })
            .collect())
    }

    async fn ack(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut jobs = self.table()?;
        if let Some(job) = jobs.get_mut(&job_id) {
            if job.status == JobStatus::Claimed {
                let now = Utc::now();
                job.status = JobStatus::Succeeded;
                job.finished_at = Some(now);
                job.updated_at = now;
            }
        }
        Ok(())
    }

    async fn retry(
        &self,
        job_id: Uuid,
        backoff: Duration,
        reason: &str,
    ) -> Result<RetryOutcome, StoreError> {
        let backoff =
            chrono::Duration::from_std(backoff).map_err(|e| StoreError::Query(e.to_string()))?;
        let mut jobs = self.table()?;
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(RetryOutcome::NotClaimed);
        };
        if job.status != JobStatus::Claimed {
            return Ok(RetryOutcome::NotClaimed);
        }

        Ok(match record_failed_attempt(job, backoff, reason) {
            JobStatus::Failed => RetryOutcome::Exhausted {
                attempts: job.attempts,
            },
            _ => RetryOutcome::Rescheduled {
                at: job.scheduled_at,
                attempts: job.attempts,
            },
        })
    }

    async fn fail(&self, job_id: Uuid, reason: &str) -> Result<bool, StoreError> {
        let mut jobs = self.table()?;
        match jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Claimed => {
                let now = Utc::now();
                job.status = JobStatus::Failed;
                job.last_error = Some(reason.to_string());
                job.claimed_at = None;
                job.finished_at = Some(now);
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.table()?.get(&job_id).cloned())
    }

    async fn failed_jobs(&self, queue: &str, limit: usize) -> Result<Vec<Job>, StoreError> {
        let jobs = self.table()?;
        let mut failed: Vec<Job> = jobs
            .values()
            .filter(|job| job.queue == queue && job.status == JobStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by(|a, b| b.finished_at.cmp(&a.finished_at).then(a.id.cmp(&b.id)));
        failed.truncate(limit);
        Ok(failed)
    }

    async fn reclaim_stale(
        &self,
        queue: &str,
        older_than: Duration,
    ) -> Result<ReclaimReport, StoreError> {
        let older_than =
            chrono::Duration::from_std(older_than).map_err(|e| StoreError::Query(e.to_string()))?;
        let mut jobs = self.table()?;
        let cutoff = Utc::now() - older_than;

        let mut report = ReclaimReport::default();
        for job in jobs.values_mut() {
            let stale = job.queue == queue
                && job.status == JobStatus::Claimed
                && job.claimed_at.is_some_and(|at| at < cutoff);
            if !stale {
                continue;
            }
            match record_failed_attempt(job, chrono::Duration::zero(), STALE_CLAIM_REASON) {
                JobStatus::Failed => report.failed += 1,
                _ => report.requeued += 1,
            }
        }
        Ok(report)
    }

    async fn stats(&self, queue: &str) -> Result<StoreStats, StoreError> {
        let jobs = self.table()?;
        let mut stats = StoreStats::default();
        for job in jobs.values().filter(|job| job.queue == queue) {
            stats.add(job.status, 1);
        }
        Ok(stats)
    }
}
