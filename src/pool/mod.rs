//! Fixed-size pool of isolated execution units.
//!
//! # Backpressure
//!
//! The pool never queues more work than it has slots. [`WorkerPool::submit`]
//! reserves a slot with an atomic compare-and-swap on the in-flight counter
//! and hands the task back as [`Submission::Saturated`] when none is free, so
//! callers pause upstream claiming instead of buffering jobs in memory. Once
//! utilization falls to the resume level, [`WorkerPool::wait_for_drain`]
//! returns and callers resume.
//!
//! # Isolation
//!
//! Each slot owns one [`ExecutionUnit`]. A unit that timed out, crashed or
//! was aborted is discarded and replaced through the [`UnitFactory`] before
//! the slot takes more work.

pub mod process;
pub mod state;
pub mod task;
pub mod unit;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::PoolError;
use crate::metrics;

pub use process::{ProcessUnit, ProcessUnitFactory, RuntimeCommand};
pub use state::{resume_level, PoolState};
pub use task::{Submission, TaskHandle, TaskReport, WorkerTask};
pub use unit::{ExecutionUnit, UnitFactory, UnitOutcome};

/// Extra time past a task's hard deadline before the pool stops waiting on a
/// unit that ignores its deadline.
const BACKSTOP_MARGIN: Duration = Duration::from_millis(250);

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of execution units.
    pub capacity: usize,
    /// Fraction of capacity at or below which a saturated pool resumes.
    pub resume_threshold: f64,
    /// Time granted past the budget before a unit is force-terminated.
    pub kill_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 4,
            resume_threshold: 0.5,
            kill_grace: Duration::from_millis(500),
        }
    }
}

impl PoolConfig {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    pub fn with_resume_threshold(mut self, threshold: f64) -> Self {
        self.resume_threshold = threshold;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStats {
    pub capacity: usize,
    pub in_flight: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub crashed: u64,
    pub cancelled: u64,
    /// Units replaced after a timeout, crash or abort.
    pub recycled: u64,
    /// Submissions refused because every slot was busy.
    pub saturated: u64,
    pub average_task_duration: Duration,
}

impl PoolStats {
    pub fn total_processed(&self) -> u64 {
        self.succeeded + self.failed + self.timed_out + self.crashed + self.cancelled
    }

    /// Success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.succeeded as f64 / total as f64) * 100.0
    }
}

#[derive(Default)]
struct SharedPoolStats {
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    crashed: AtomicU64,
    cancelled: AtomicU64,
    recycled: AtomicU64,
    saturated: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl SharedPoolStats {
    fn record(&self, outcome: &UnitOutcome, duration: Duration) {
        let counter = match outcome {
            UnitOutcome::Completed(_) => &self.succeeded,
            UnitOutcome::Failed { .. } => &self.failed,
            UnitOutcome::TimedOut => &self.timed_out,
            UnitOutcome::Crashed { .. } => &self.crashed,
            UnitOutcome::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, state: PoolState) -> PoolStats {
        let mut stats = PoolStats {
            capacity: state.capacity,
            in_flight: state.in_flight,
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            timed_out: self.timed_out.load(Ordering::SeqCst),
            crashed: self.crashed.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
            recycled: self.recycled.load(Ordering::SeqCst),
            saturated: self.saturated.load(Ordering::SeqCst),
            average_task_duration: Duration::ZERO,
        };
        let total = stats.total_processed();
        if total > 0 {
            stats.average_task_duration =
                Duration::from_millis(self.total_duration_ms.load(Ordering::SeqCst) / total);
        }
        stats
    }
}

/// A task on its way to a slot.
struct Dispatch {
    task: WorkerTask,
    reply: oneshot::Sender<TaskReport>,
}

struct PoolInner {
    capacity: usize,
    resume_level: usize,
    kill_grace: Duration,
    in_flight: AtomicUsize,
    state_tx: watch::Sender<PoolState>,
    sender: Mutex<Option<mpsc::Sender<Dispatch>>>,
    closed: AtomicBool,
    abort: CancellationToken,
    stats: SharedPoolStats,
}

impl PoolInner {
    /// Claims a slot if one is free.
    fn try_reserve(&self) -> bool {
        let mut current = self.in_flight.load(Ordering::SeqCst);
        loop {
            if current >= self.capacity {
                return false;
            }
            match self.in_flight.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    self.publish();
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.publish();
    }

    /// Publishes the counter as read under the channel's lock, so the last
    /// publisher always leaves the latest value behind.
    fn publish(&self) {
        let capacity = self.capacity;
        self.state_tx.send_modify(|state| {
            state.in_flight = self.in_flight.load(Ordering::SeqCst);
            state.capacity = capacity;
        });
        let state = *self.state_tx.borrow();
        metrics::set_pool_state(state.in_flight, state.capacity);
    }

    fn state(&self) -> PoolState {
        PoolState {
            in_flight: self.in_flight.load(Ordering::SeqCst),
            capacity: self.capacity,
        }
    }
}

/// Fixed-size pool running [`WorkerTask`]s on isolated units.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Creates one unit per slot and starts the slot tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: PoolConfig, factory: Arc<dyn UnitFactory>) -> Result<Self, PoolError> {
        if config.capacity == 0 {
            return Err(PoolError::ZeroCapacity);
        }

        let mut units = Vec::with_capacity(config.capacity);
        for slot in 0..config.capacity {
            units.push(factory.create(slot)?);
        }

        let (tx, rx) = mpsc::channel(config.capacity);
        let (state_tx, _) = watch::channel(PoolState::new(config.capacity));
        let inner = Arc::new(PoolInner {
            capacity: config.capacity,
            resume_level: resume_level(config.capacity, config.resume_threshold),
            kill_grace: config.kill_grace,
            in_flight: AtomicUsize::new(0),
            state_tx,
            sender: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
            abort: CancellationToken::new(),
            stats: SharedPoolStats::default(),
        });
        inner.publish();

        let receiver = Arc::new(AsyncMutex::new(rx));
        let handles = units
            .into_iter()
            .enumerate()
            .map(|(slot, unit)| {
                let slot_worker = Slot {
                    id: slot,
                    unit: Some(unit),
                    factory: Arc::clone(&factory),
                    inner: Arc::clone(&inner),
                    receiver: Arc::clone(&receiver),
                };
                tokio::spawn(slot_worker.run())
            })
            .collect();

        info!(
            capacity = config.capacity,
            resume_level = inner.resume_level,
            "Worker pool started"
        );

        Ok(Self {
            inner,
            handles: Mutex::new(handles),
        })
    }

    /// Hands `task` to a free slot, or returns it as
    /// [`Submission::Saturated`] when every slot is busy.
    ///
    /// Never waits for a task to run; an accepted task is already counted
    /// as in flight when this returns.
    pub fn submit(&self, task: WorkerTask) -> Result<Submission, PoolError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }
        if !self.inner.try_reserve() {
            self.inner.stats.saturated.fetch_add(1, Ordering::SeqCst);
            debug!(job_id = %task.job.id, "Pool saturated, task handed back");
            return Ok(Submission::Saturated(task));
        }

        let sender = match self.inner.sender.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let Some(sender) = sender else {
            self.inner.release();
            return Err(PoolError::Closed);
        };

        let (reply, rx) = oneshot::channel();
        let job_id = task.job.id;
        let task_kind = task.job.task_kind.clone();
        // The channel holds `capacity` entries and at most `capacity` tasks
        // are reserved, so a send can only fail once the slots are gone.
        if sender.try_send(Dispatch { task, reply }).is_err() {
            self.inner.release();
            return Err(PoolError::Closed);
        }

        Ok(Submission::Accepted(TaskHandle {
            job_id,
            task_kind,
            rx,
        }))
    }

    pub fn state(&self) -> PoolState {
        self.inner.state()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// In-flight count at or below which a saturated pool resumes.
    pub fn resume_level(&self) -> usize {
        self.inner.resume_level
    }

    /// Receives every change of [`PoolState`].
    pub fn subscribe(&self) -> watch::Receiver<PoolState> {
        self.inner.state_tx.subscribe()
    }

    /// Waits until utilization is at or below the resume level.
    pub async fn wait_for_drain(&self) {
        let level = self.inner.resume_level;
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|state| state.in_flight <= level).await;
    }

    /// Waits until no task is in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|state| state.is_idle()).await;
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.stats.to_pool_stats(self.inner.state())
    }

    /// Stops accepting tasks. Tasks already accepted still run.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        match self.inner.sender.lock() {
            Ok(mut guard) => {
                guard.take();
            }
            Err(poisoned) => {
                poisoned.into_inner().take();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Force-terminates every running unit; their tasks report
    /// [`UnitOutcome::Cancelled`], as do tasks not yet started.
    pub fn abort_in_flight(&self) {
        if !self.inner.abort.is_cancelled() {
            warn!(in_flight = self.state().in_flight, "Aborting in-flight tasks");
        }
        self.inner.abort.cancel();
    }

    /// Closes the pool and waits up to `grace` for accepted tasks to finish,
    /// then aborts whatever is left. Returns whether everything finished
    /// within the grace period.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.close();
        let handles: Vec<JoinHandle<()>> = match self.handles.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };

        let mut join_all = Box::pin(async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker slot panicked during shutdown");
                }
            }
        });

        match tokio::time::timeout(grace, &mut join_all).await {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                true
            }
            Err(_) => {
                self.abort_in_flight();
                join_all.await;
                warn!(grace_ms = grace.as_millis() as u64, "Worker pool shutdown forced");
                false
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
        self.inner.abort.cancel();
    }
}

/// One slot: pulls dispatches and runs them on its unit.
struct Slot {
    id: usize,
    unit: Option<Box<dyn ExecutionUnit>>,
    factory: Arc<dyn UnitFactory>,
    inner: Arc<PoolInner>,
    receiver: Arc<AsyncMutex<mpsc::Receiver<Dispatch>>>,
}

impl Slot {
    async fn run(mut self) {
        debug!(slot = self.id, "Worker slot started");
        loop {
            let next = {
                let mut rx = self.receiver.lock().await;
                rx.recv().await
            };
            let Some(Dispatch { task, reply }) = next else {
                break;
            };

            let started = Instant::now();
            let (outcome, recycled) = self.execute(&task).await;
            let elapsed = started.elapsed();

            self.inner.stats.record(&outcome, elapsed);
            metrics::record_task(&task.job.task_kind, outcome.label(), elapsed);
            debug!(
                slot = self.id,
                job_id = %task.job.id,
                outcome = outcome.label(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Task finished"
            );

            // Free the slot before reporting so a caller reacting to the
            // report already sees the capacity.
            self.inner.release();
            let _ = reply.send(TaskReport {
                job_id: task.job.id,
                task_kind: task.job.task_kind,
                outcome,
                slot: Some(self.id),
                elapsed,
                recycled,
            });
        }

        if let Some(mut unit) = self.unit.take() {
            unit.shutdown().await;
        }
        debug!(slot = self.id, "Worker slot stopped");
    }

    async fn execute(&mut self, task: &WorkerTask) -> (UnitOutcome, bool) {
        if self.inner.abort.is_cancelled() {
            return (UnitOutcome::Cancelled, false);
        }

        if self.unit.is_none() {
            match self.factory.create(self.id) {
                Ok(unit) => self.unit = Some(unit),
                Err(e) => {
                    return (
                        UnitOutcome::Crashed {
                            reason: e.to_string(),
                        },
                        false,
                    )
                }
            }
        }
        let Some(unit) = self.unit.as_mut() else {
            return (
                UnitOutcome::Crashed {
                    reason: format!("no execution unit for slot {}", self.id),
                },
                false,
            );
        };

        let deadline = Instant::now() + task.budget() + self.inner.kill_grace;
        let backstop = deadline + BACKSTOP_MARGIN;
        let abort = self.inner.abort.clone();

        let outcome = tokio::select! {
            biased;
            _ = abort.cancelled() => UnitOutcome::Cancelled,
            result = tokio::time::timeout_at(
                backstop,
                AssertUnwindSafe(unit.execute(task, deadline)).catch_unwind(),
            ) => match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(panic)) => {
                    let reason = panic_message(panic.as_ref());
                    error!(slot = self.id, job_id = %task.job.id, reason = %reason, "Execution unit panicked");
                    UnitOutcome::Crashed {
                        reason: format!("execution unit panicked: {reason}"),
                    }
                }
                Err(_) => UnitOutcome::TimedOut,
            }
        };

        let recycled = outcome.requires_recycle();
        if recycled {
            self.recycle().await;
        }
        (outcome, recycled)
    }

    async fn recycle(&mut self) {
        if let Some(mut old) = self.unit.take() {
            old.shutdown().await;
        }
        match self.factory.create(self.id) {
            Ok(unit) => {
                self.unit = Some(unit);
                self.inner.stats.recycled.fetch_add(1, Ordering::SeqCst);
                debug!(slot = self.id, "Execution unit recycled");
            }
            Err(e) => {
                // Retried lazily before the slot's next task.
                warn!(slot = self.id, error = %e, "Failed to recreate execution unit");
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
