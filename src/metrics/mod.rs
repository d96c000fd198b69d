//! Prometheus-based observability for the runner.
//!
//! Exposes pool utilization, per-task outcome counters and durations, lock
//! events and store errors.
//!
//! # Example
//!
//! ```ignore
//! use plugin_runner::metrics::{export_metrics, init_metrics};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! plugin_runner::metrics::record_jobs_claimed(4);
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

use std::time::Duration;

pub use collectors::{LockEvent, MetricsCollector};
pub use prometheus::{export_metrics, init_metrics, spawn_metrics_writer, write_metrics_file};

pub use prometheus::{
    JOBS_CLAIMED_TOTAL, LOCK_EVENTS_TOTAL, ORCHESTRATOR_STATE, POOL_CAPACITY, POOL_IN_FLIGHT,
    REGISTRY, STORE_ERRORS_TOTAL, TASKS_TOTAL, TASK_DURATION, TRANSFORM_CACHE_TOTAL,
};

pub fn record_task(task_kind: &str, outcome: &str, duration: Duration) {
    MetricsCollector.record_task(task_kind, outcome, duration);
}

pub fn set_pool_state(in_flight: usize, capacity: usize) {
    MetricsCollector.set_pool_state(in_flight, capacity);
}

pub fn record_lock_event(event: LockEvent) {
    MetricsCollector.record_lock_event(event);
}

pub fn record_jobs_claimed(count: usize) {
    MetricsCollector.record_jobs_claimed(count);
}

pub fn record_store_error(operation: &str) {
    MetricsCollector.record_store_error(operation);
}

pub fn record_transform_cache(hit: bool) {
    MetricsCollector.record_transform_cache(hit);
}

pub fn set_orchestrator_state(code: u8) {
    MetricsCollector.set_orchestrator_state(code);
}
