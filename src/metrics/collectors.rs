//! Recording helpers for the runner's observability surface.
//!
//! [`MetricsCollector`] wraps the raw Prometheus statics with consistent
//! labels; every method is a no-op before `init_metrics()`.

use std::time::Duration;

use super::prometheus::{
    JOBS_CLAIMED_TOTAL, LOCK_EVENTS_TOTAL, ORCHESTRATOR_STATE, POOL_CAPACITY, POOL_IN_FLIGHT,
    STORE_ERRORS_TOTAL, TASKS_TOTAL, TASK_DURATION, TRANSFORM_CACHE_TOTAL,
};

/// Distributed lock lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockEvent {
    Acquired,
    Renewed,
    /// A renewal attempt failed at the transport level; the lock may still be held.
    RenewError,
    Lost,
    Released,
}

impl LockEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockEvent::Acquired => "acquired",
            LockEvent::Renewed => "renewed",
            LockEvent::RenewError => "renew_error",
            LockEvent::Lost => "lost",
            LockEvent::Released => "released",
        }
    }
}

/// Metrics collector for plugin-runner operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Records one finished task.
    ///
    /// `outcome` is one of `succeeded`, `failed`, `timed_out`, `crashed`,
    /// `cancelled`.
    pub fn record_task(&self, task_kind: &str, outcome: &str, duration: Duration) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total.with_label_values(&[task_kind, outcome]).inc();
        }

        if let Some(task_duration) = TASK_DURATION.get() {
            task_duration
                .with_label_values(&[task_kind])
                .observe(duration.as_secs_f64());
        }

        tracing::trace!(
            task_kind = task_kind,
            outcome = outcome,
            duration_ms = duration.as_millis() as u64,
            "Recorded task metric"
        );
    }

    pub fn set_pool_state(&self, in_flight: usize, capacity: usize) {
        if let Some(gauge) = POOL_IN_FLIGHT.get() {
            gauge.set(in_flight as f64);
        }
        if let Some(gauge) = POOL_CAPACITY.get() {
            gauge.set(capacity as f64);
        }
    }

    pub fn record_lock_event(&self, event: LockEvent) {
        if let Some(events) = LOCK_EVENTS_TOTAL.get() {
            events.with_label_values(&[event.as_str()]).inc();
        }
        tracing::trace!(event = event.as_str(), "Recorded lock event");
    }

    pub fn record_jobs_claimed(&self, count: usize) {
        if let Some(counter) = JOBS_CLAIMED_TOTAL.get() {
            counter.inc_by(count as u64);
        }
    }

    pub fn record_store_error(&self, operation: &str) {
        if let Some(errors) = STORE_ERRORS_TOTAL.get() {
            errors.with_label_values(&[operation]).inc();
        }
    }

    pub fn record_transform_cache(&self, hit: bool) {
        if let Some(lookups) = TRANSFORM_CACHE_TOTAL.get() {
            let result = if hit { "hit" } else { "miss" };
            lookups.with_label_values(&[result]).inc();
        }
    }

    pub fn set_orchestrator_state(&self, code: u8) {
        if let Some(gauge) = ORCHESTRATOR_STATE.get() {
            gauge.set(f64::from(code));
        }
    }
}
