//! Consumer orchestrator: lock → claim → dispatch → settle.
//!
//! One [`Orchestrator`] drives a queue's consumer loop while it holds the
//! fleet-wide consumer lock:
//!
//! 1. poll [`DistributedLock::try_acquire`] until the lock is ours;
//! 2. renew it in the background every `ttl / 3` (see [`renewal`]);
//! 3. claim at most as many due jobs as the pool has free slots, compile
//!    their plugin and submit them to the [`WorkerPool`];
//! 4. settle every finished task against the store: `ack` on success,
//!    `retry` with backoff on timeout, crash or handler error, `fail` on a
//!    transform error or unknown task kind;
//! 5. pause while the pool is saturated, resume on its drain signal.
//!
//! Shutdown and lock loss both stop claiming at once. In-flight tasks get
//! `drain_grace` to finish; whatever is still running afterwards is aborted
//! and its job stays claimed until the stale-claim sweep recovers it.

pub mod backoff;
pub mod renewal;
pub mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{JobFailure, OrchestratorError};
use crate::lock::{DistributedLock, LockToken};
use crate::metrics::{self, LockEvent};
use crate::plugins::PluginRegistry;
use crate::pool::{Submission, TaskReport, UnitOutcome, WorkerPool, WorkerTask};
use crate::store::{Job, JobStore, RetryOutcome, DEFAULT_QUEUE};

pub use backoff::{retry_transient, ExponentialBackoff};
pub use renewal::RenewalExit;
pub use state::{OrchestratorState, RunMode, StopReason};

/// Something that happened to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorEvent {
    StateChanged {
        from: OrchestratorState,
        to: OrchestratorState,
    },
    LockAcquired {
        resource: String,
        holder_id: String,
    },
    LockLost {
        resource: String,
    },
    Paused {
        in_flight: usize,
    },
    Resumed {
        in_flight: usize,
    },
}

/// Configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub queue: String,
    /// Lock key guarding this queue's consumer loop.
    pub lock_resource: String,
    pub lock_ttl: Duration,
    /// Pause between acquisition attempts while another process holds the lock.
    pub acquire_interval: Duration,
    /// Pause after a claim that returned nothing.
    pub poll_interval: Duration,
    pub claim_batch_size: usize,
    pub drain_grace: Duration,
    /// Claims older than this are recovered by the stale-claim sweep.
    pub claim_timeout: Duration,
    pub sweep_interval: Duration,
    /// Delay before a failed job's next attempt.
    pub retry_backoff: ExponentialBackoff,
    /// Delay between retries of a failing store operation.
    pub store_backoff: ExponentialBackoff,
    /// Tries per ack/retry/fail before the job is left claimed for the sweep.
    pub settle_attempts: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE)
    }
}

impl OrchestratorConfig {
    pub fn new(queue: &str) -> Self {
        Self {
            queue: queue.to_string(),
            lock_resource: format!("job-consumer:{queue}"),
            lock_ttl: Duration::from_secs(15),
            acquire_interval: Duration::from_secs(2),
            poll_interval: Duration::from_millis(500),
            claim_batch_size: 16,
            drain_grace: Duration::from_secs(30),
            claim_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            retry_backoff: ExponentialBackoff::default().with_jitter(0.2),
            store_backoff: ExponentialBackoff::new(
                Duration::from_millis(100),
                Duration::from_secs(5),
            )
            .with_jitter(0.2),
            settle_attempts: 5,
        }
    }

    pub fn with_lock_resource(mut self, resource: impl Into<String>) -> Self {
        self.lock_resource = resource.into();
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_acquire_interval(mut self, interval: Duration) -> Self {
        self.acquire_interval = interval;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_claim_batch_size(mut self, size: usize) -> Self {
        self.claim_batch_size = size.max(1);
        self
    }

    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_store_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.store_backoff = backoff;
        self
    }

    pub fn with_settle_attempts(mut self, attempts: u32) -> Self {
        self.settle_attempts = attempts.max(1);
        self
    }
}

/// Summary of one [`Orchestrator::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub reason: StopReason,
    /// Jobs handed to the pool.
    pub dispatched: u64,
    pub succeeded: u64,
    /// Jobs rescheduled for another attempt.
    pub retried: u64,
    /// Jobs that ended terminally failed.
    pub failed: u64,
    /// Jobs left claimed for the stale-claim sweep.
    pub abandoned: u64,
}

impl RunReport {
    fn new(reason: StopReason) -> Self {
        Self {
            reason,
            dispatched: 0,
            succeeded: 0,
            retried: 0,
            failed: 0,
            abandoned: 0,
        }
    }

    fn tally(&mut self, result: Result<Settlement, JoinError>) {
        match result {
            Ok(Settlement::Acked) => self.succeeded += 1,
            Ok(Settlement::Retried) => self.retried += 1,
            Ok(Settlement::Failed) => self.failed += 1,
            Ok(Settlement::Skipped) => {}
            Ok(Settlement::LeftClaimed) => self.abandoned += 1,
            Err(e) => {
                error!(error = %e, "Settlement task panicked");
                self.abandoned += 1;
            }
        }
    }
}

/// What settling one job did to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Acked,
    Retried,
    Failed,
    /// The job was no longer claimed; nothing changed.
    Skipped,
    LeftClaimed,
}

/// Writes task outcomes back to the store.
#[derive(Clone)]
struct Settler {
    store: Arc<dyn JobStore>,
    retry_backoff: ExponentialBackoff,
    store_backoff: ExponentialBackoff,
    attempts: u32,
}

impl Settler {
    async fn settle(self, report: TaskReport, job_attempts: u32, budget: Duration) -> Settlement {
        let job_id = report.job_id;
        match report.outcome {
            UnitOutcome::Completed(_) => {
                let acked = retry_transient("ack", &self.store_backoff, self.attempts, || {
                    self.store.ack(job_id)
                })
                .await;
                match acked {
                    Ok(()) => {
                        debug!(job_id = %job_id, elapsed_ms = report.elapsed.as_millis() as u64, "Job succeeded");
                        Settlement::Acked
                    }
                    Err(e) => {
                        error!(job_id = %job_id, error = %e, "Could not ack job; left claimed");
                        Settlement::LeftClaimed
                    }
                }
            }
            UnitOutcome::Cancelled => {
                warn!(job_id = %job_id, "Task aborted; job left claimed for the stale-claim sweep");
                Settlement::LeftClaimed
            }
            ref outcome => match outcome.failure(budget) {
                Some(failure) => self.settle_failure(job_id, job_attempts, failure).await,
                None => Settlement::LeftClaimed,
            },
        }
    }

    async fn settle_failure(self, job_id: Uuid, job_attempts: u32, failure: JobFailure) -> Settlement {
        let reason = failure.to_string();

        if !failure.is_retryable() {
            let failed = retry_transient("fail", &self.store_backoff, self.attempts, || {
                self.store.fail(job_id, &reason)
            })
            .await;
            return match failed {
                Ok(true) => {
                    warn!(job_id = %job_id, error = %reason, "Job failed without retry");
                    Settlement::Failed
                }
                Ok(false) => Settlement::Skipped,
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "Could not fail job; left claimed");
                    Settlement::LeftClaimed
                }
            };
        }

        let delay = self.retry_backoff.delay_for_job(job_id, job_attempts);
        let retried = retry_transient("retry", &self.store_backoff, self.attempts, || {
            self.store.retry(job_id, delay, &reason)
        })
        .await;
        match retried {
            Ok(RetryOutcome::Rescheduled { attempts, .. }) => {
                info!(
                    job_id = %job_id,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "Job rescheduled"
                );
                Settlement::Retried
            }
            Ok(RetryOutcome::Exhausted { attempts }) => {
                warn!(job_id = %job_id, attempts, error = %reason, "Job failed after exhausting its attempts");
                Settlement::Failed
            }
            Ok(RetryOutcome::NotClaimed) => {
                warn!(job_id = %job_id, "Job no longer claimed; retry skipped");
                Settlement::Skipped
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Could not reschedule job; left claimed");
                Settlement::LeftClaimed
            }
        }
    }
}

/// Drives one queue's consumer loop while holding its lock.
///
/// Single-use: a second [`run`](Self::run) fails with
/// [`OrchestratorError::AlreadyStarted`].
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn JobStore>,
    lock: Arc<dyn DistributedLock>,
    pool: Arc<WorkerPool>,
    plugins: Arc<PluginRegistry>,
    state: state::StateMachine,
    events: broadcast::Sender<OrchestratorEvent>,
    started: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn JobStore>,
        lock: Arc<dyn DistributedLock>,
        pool: Arc<WorkerPool>,
        plugins: Arc<PluginRegistry>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            store,
            lock,
            pool,
            plugins,
            state: state::StateMachine::new(events.clone()),
            events,
            started: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn state(&self) -> OrchestratorState {
        self.state.current()
    }

    pub fn watch_state(&self) -> watch::Receiver<OrchestratorState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    /// Runs until `shutdown` is cancelled or the lock is lost, then drains.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<RunReport, OrchestratorError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(OrchestratorError::AlreadyStarted);
        }

        self.state.transition(OrchestratorState::AcquiringLock)?;
        let acquired = match self.acquire_lock(&shutdown).await {
            Ok(acquired) => acquired,
            Err(e) => {
                self.pool.close();
                self.state.transition(OrchestratorState::Stopped)?;
                return Err(e);
            }
        };
        let Some((token, acquired_at)) = acquired else {
            info!("Shutdown requested before the lock was acquired");
            self.pool.close();
            self.state.transition(OrchestratorState::Stopped)?;
            return Ok(RunReport::new(StopReason::Shutdown));
        };

        let lost = CancellationToken::new();
        let stop_renewal = CancellationToken::new();
        // Releases the lock even if the run bails out early.
        let _renewal_guard = stop_renewal.clone().drop_guard();
        let renewal = renewal::spawn_renewal(
            Arc::clone(&self.lock),
            token,
            self.config.lock_ttl,
            acquired_at,
            lost.clone(),
            stop_renewal.clone(),
            self.events.clone(),
        );

        self.state
            .transition(OrchestratorState::Running(RunMode::Active))?;

        let mut report = RunReport::new(StopReason::Shutdown);
        let mut inflight: JoinSet<Settlement> = JoinSet::new();
        let reason = self
            .dispatch_loop(&shutdown, &lost, &mut inflight, &mut report)
            .await?;
        report.reason = reason;

        self.state.transition(OrchestratorState::Draining(reason))?;
        self.pool.close();
        self.drain(&mut inflight, &mut report).await;

        stop_renewal.cancel();
        match renewal.await {
            Ok(exit) => debug!(exit = ?exit, "Renewal loop finished"),
            Err(e) => error!(error = %e, "Renewal loop panicked"),
        }

        self.state.transition(OrchestratorState::Stopped)?;
        info!(
            reason = %report.reason,
            dispatched = report.dispatched,
            succeeded = report.succeeded,
            retried = report.retried,
            failed = report.failed,
            abandoned = report.abandoned,
            "Orchestrator stopped"
        );
        Ok(report)
    }

    async fn acquire_lock(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<Option<(LockToken, Instant)>, OrchestratorError> {
        let resource = self.config.lock_resource.as_str();
        info!(resource, holder_id = self.lock.holder_id(), "Acquiring consumer lock");

        loop {
            if shutdown.is_cancelled() {
                return Ok(None);
            }

            let attempted = Instant::now();
            match self.lock.try_acquire(resource, self.config.lock_ttl).await {
                Ok(Some(token)) => {
                    metrics::record_lock_event(LockEvent::Acquired);
                    info!(resource, holder_id = %token.holder_id, "Consumer lock acquired");
                    let _ = self.events.send(OrchestratorEvent::LockAcquired {
                        resource: token.resource.clone(),
                        holder_id: token.holder_id.clone(),
                    });
                    return Ok(Some((token, attempted)));
                }
                Ok(None) => debug!(resource, "Consumer lock held elsewhere"),
                Err(e) if e.is_transient() => {
                    warn!(resource, error = %e, "Lock store unavailable while acquiring")
                }
                Err(e) => return Err(e.into()),
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(None),
                _ = tokio::time::sleep(self.config.acquire_interval) => {}
            }
        }
    }

    async fn dispatch_loop(
        &self,
        shutdown: &CancellationToken,
        lost: &CancellationToken,
        inflight: &mut JoinSet<Settlement>,
        report: &mut RunReport,
    ) -> Result<StopReason, OrchestratorError> {
        let mut next_sweep = Instant::now();

        loop {
            if let Some(reason) = halted(shutdown, lost) {
                return Ok(reason);
            }
            while let Some(Some(result)) = inflight.join_next().now_or_never() {
                report.tally(result);
            }

            if Instant::now() >= next_sweep {
                tokio::select! {
                    biased;
                    _ = lost.cancelled() => return Ok(StopReason::LockLost),
                    _ = shutdown.cancelled() => return Ok(StopReason::Shutdown),
                    _ = self.sweep() => {}
                }
                next_sweep = Instant::now() + self.config.sweep_interval;
            }

            let pool_state = self.pool.state();
            if pool_state.is_saturated() {
                if let Some(reason) = self.pause(shutdown, lost).await? {
                    return Ok(reason);
                }
                continue;
            }

            let limit = pool_state.free().min(self.config.claim_batch_size);
            let claimed = tokio::select! {
                biased;
                _ = lost.cancelled() => return Ok(StopReason::LockLost),
                _ = shutdown.cancelled() => return Ok(StopReason::Shutdown),
                result = retry_transient("claim", &self.config.store_backoff, u32::MAX, || {
                    self.store.claim_next(&self.config.queue, limit)
                }) => result,
            };

            let jobs = match claimed {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(queue = %self.config.queue, error = %e, "Claim failed");
                    Vec::new()
                }
            };

            if jobs.is_empty() {
                tokio::select! {
                    biased;
                    _ = lost.cancelled() => return Ok(StopReason::LockLost),
                    _ = shutdown.cancelled() => return Ok(StopReason::Shutdown),
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            metrics::record_jobs_claimed(jobs.len());
            debug!(count = jobs.len(), queue = %self.config.queue, "Claimed jobs");

            let mut jobs = jobs.into_iter();
            while let Some(job) = jobs.next() {
                let mut next = Some(job);
                while let Some(job) = next.take() {
                    // Checked before every dispatch so a lost lock stops work
                    // mid-batch.
                    let reason = match halted(shutdown, lost) {
                        Some(reason) => Some(reason),
                        None => match self.dispatch(job, inflight, report)? {
                            None => None,
                            Some(returned) => {
                                let reason = self.pause(shutdown, lost).await?;
                                next = Some(returned);
                                reason
                            }
                        },
                    };
                    if let Some(reason) = reason {
                        let left = 1 + jobs.len() as u64;
                        report.abandoned += left;
                        warn!(abandoned = left, reason = %reason, "Stopping with claimed jobs undispatched");
                        return Ok(reason);
                    }
                }
            }
        }
    }

    /// Submits one job, or hands it back when the pool is saturated.
    fn dispatch(
        &self,
        job: Job,
        inflight: &mut JoinSet<Settlement>,
        report: &mut RunReport,
    ) -> Result<Option<Job>, OrchestratorError> {
        let settler = self.settler();

        let script = match self.plugins.compile(&job.task_kind) {
            Ok(script) => script,
            Err(failure) => {
                warn!(job_id = %job.id, task_kind = %job.task_kind, error = %failure, "Job cannot run");
                inflight.spawn(settler.settle_failure(job.id, job.attempts, failure));
                return Ok(None);
            }
        };

        let attempts = job.attempts;
        let budget = script.budget;
        match self.pool.submit(WorkerTask::new(job, script))? {
            Submission::Accepted(handle) => {
                report.dispatched += 1;
                debug!(job_id = %handle.job_id(), attempts, "Job dispatched");
                inflight.spawn(async move {
                    let task_report = handle.await;
                    settler.settle(task_report, attempts, budget).await
                });
                Ok(None)
            }
            Submission::Saturated(task) => Ok(Some(task.job)),
        }
    }

    /// Waits for the pool to drain. Returns a stop reason if one arrives first.
    async fn pause(
        &self,
        shutdown: &CancellationToken,
        lost: &CancellationToken,
    ) -> Result<Option<StopReason>, OrchestratorError> {
        let pool_state = self.pool.state();
        self.state
            .transition(OrchestratorState::Running(RunMode::Paused))?;
        info!(
            in_flight = pool_state.in_flight,
            capacity = pool_state.capacity,
            "Pool saturated, pausing claims"
        );
        let _ = self.events.send(OrchestratorEvent::Paused {
            in_flight: pool_state.in_flight,
        });

        let stop = tokio::select! {
            biased;
            _ = lost.cancelled() => Some(StopReason::LockLost),
            _ = shutdown.cancelled() => Some(StopReason::Shutdown),
            _ = self.pool.wait_for_drain() => None,
        };

        if stop.is_none() {
            let in_flight = self.pool.state().in_flight;
            self.state
                .transition(OrchestratorState::Running(RunMode::Active))?;
            info!(in_flight, "Pool drained, resuming claims");
            let _ = self.events.send(OrchestratorEvent::Resumed { in_flight });
        }
        Ok(stop)
    }

    async fn drain(&self, inflight: &mut JoinSet<Settlement>, report: &mut RunReport) {
        info!(
            in_flight = inflight.len(),
            grace_ms = self.config.drain_grace.as_millis() as u64,
            "Draining in-flight tasks"
        );
        let deadline = Instant::now() + self.config.drain_grace;

        loop {
            tokio::select! {
                next = inflight.join_next() => match next {
                    Some(result) => report.tally(result),
                    None => return,
                },
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        warn!(remaining = inflight.len(), "Drain grace elapsed, aborting in-flight tasks");
        self.pool.abort_in_flight();
        while let Some(result) = inflight.join_next().await {
            report.tally(result);
        }
    }

    async fn sweep(&self) {
        let swept = retry_transient(
            "reclaim",
            &self.config.store_backoff,
            self.config.settle_attempts,
            || {
                self.store
                    .reclaim_stale(&self.config.queue, self.config.claim_timeout)
            },
        )
        .await;
        match swept {
            Ok(recovered) if recovered.total() > 0 => warn!(
                requeued = recovered.requeued,
                failed = recovered.failed,
                "Recovered stale claims"
            ),
            Ok(_) => debug!("No stale claims"),
            Err(e) => warn!(error = %e, "Stale-claim sweep failed"),
        }
    }

    fn settler(&self) -> Settler {
        Settler {
            store: Arc::clone(&self.store),
            retry_backoff: self.config.retry_backoff,
            store_backoff: self.config.store_backoff,
            attempts: self.config.settle_attempts,
        }
    }
}

/// Lock loss wins over shutdown: it is the more urgent reason to stop.
fn halted(shutdown: &CancellationToken, lost: &CancellationToken) -> Option<StopReason> {
    if lost.is_cancelled() {
        Some(StopReason::LockLost)
    } else if shutdown.is_cancelled() {
        Some(StopReason::Shutdown)
    } else {
        None
    }
}
