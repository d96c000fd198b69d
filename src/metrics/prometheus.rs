//! Prometheus metrics registration and export.
//!
//! Metrics live in `OnceLock` statics so recording from anywhere in the
//! crate is a cheap lookup, and a no-op until [`init_metrics`] has run.

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, Opts, Registry,
    TextEncoder,
};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Global Prometheus registry for all plugin-runner metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Tasks finished by the worker pool, labeled by task kind and outcome.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Task execution duration in seconds, labeled by task kind.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Tasks currently running in the pool.
pub static POOL_IN_FLIGHT: OnceLock<Gauge> = OnceLock::new();

/// Number of execution units in the pool.
pub static POOL_CAPACITY: OnceLock<Gauge> = OnceLock::new();

/// Lock lifecycle events, labeled by event.
pub static LOCK_EVENTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Jobs claimed from the store.
pub static JOBS_CLAIMED_TOTAL: OnceLock<IntCounter> = OnceLock::new();

/// Failed store operations, labeled by operation.
pub static STORE_ERRORS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Transform cache lookups, labeled by result (`hit` / `miss`).
pub static TRANSFORM_CACHE_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Current orchestrator state as a numeric code.
pub static ORCHESTRATOR_STATE: OnceLock<Gauge> = OnceLock::new();

/// Creates every metric and registers it with the global registry.
///
/// Call once at startup. Later calls build a fresh registry but leave the
/// statics from the first call in place.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let tasks_total = CounterVec::new(
        Opts::new("plugin_runner_tasks_total", "Tasks finished by the worker pool"),
        &["task_kind", "outcome"],
    )?;

    let task_duration = HistogramVec::new(
        HistogramOpts::new(
            "plugin_runner_task_duration_seconds",
            "Task execution duration in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["task_kind"],
    )?;

    let pool_in_flight = Gauge::new(
        "plugin_runner_pool_in_flight",
        "Tasks currently running in the worker pool",
    )?;

    let pool_capacity = Gauge::new(
        "plugin_runner_pool_capacity",
        "Number of execution units in the worker pool",
    )?;

    let lock_events_total = CounterVec::new(
        Opts::new("plugin_runner_lock_events_total", "Distributed lock events"),
        &["event"],
    )?;

    let jobs_claimed_total = IntCounter::new(
        "plugin_runner_jobs_claimed_total",
        "Jobs claimed from the store",
    )?;

    let store_errors_total = CounterVec::new(
        Opts::new("plugin_runner_store_errors_total", "Failed job store operations"),
        &["operation"],
    )?;

    let transform_cache_total = CounterVec::new(
        Opts::new(
            "plugin_runner_transform_cache_total",
            "Transform cache lookups",
        ),
        &["result"],
    )?;

    let orchestrator_state = Gauge::new(
        "plugin_runner_orchestrator_state",
        "Orchestrator state (0 idle, 1 acquiring, 2 running, 3 paused, 4 draining, 5 stopped)",
    )?;

    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(pool_in_flight.clone()))?;
    registry.register(Box::new(pool_capacity.clone()))?;
    registry.register(Box::new(lock_events_total.clone()))?;
    registry.register(Box::new(jobs_claimed_total.clone()))?;
    registry.register(Box::new(store_errors_total.clone()))?;
    registry.register(Box::new(transform_cache_total.clone()))?;
    registry.register(Box::new(orchestrator_state.clone()))?;

    // Already set means already initialized.
    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_DURATION.set(task_duration);
    let _ = POOL_IN_FLIGHT.set(pool_in_flight);
    let _ = POOL_CAPACITY.set(pool_capacity);
    let _ = LOCK_EVENTS_TOTAL.set(lock_events_total);
    let _ = JOBS_CLAIMED_TOTAL.set(jobs_claimed_total);
    let _ = STORE_ERRORS_TOTAL.set(store_errors_total);
    let _ = TRANSFORM_CACHE_TOTAL.set(transform_cache_total);
    let _ = ORCHESTRATOR_STATE.set(orchestrator_state);

    tracing::info!("Prometheus metrics initialized");

    Ok(())
}

/// Exports all registered metrics in the Prometheus text format.
///
/// Returns a comment line instead when metrics were never initialized or
/// encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// Writes [`export_metrics`] to `path`, replacing the previous snapshot
/// through a rename so readers never see a partial file.
pub async fn write_metrics_file(path: &Path) -> std::io::Result<()> {
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);
    tokio::fs::write(&staging, export_metrics()).await?;
    tokio::fs::rename(&staging, path).await
}

/// Rewrites the metrics file every `interval` until `stop`, then once more
/// so the final counters are kept.
pub fn spawn_metrics_writer(
    path: PathBuf,
    interval: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let stopping = tokio::select! {
                _ = stop.cancelled() => true,
                _ = tokio::time::sleep(interval) => false,
            };
            if let Err(e) = write_metrics_file(&path).await {
                tracing::warn!(path = %path.display(), error = %e, "Failed to write metrics file");
            }
            if stopping {
                break;
            }
        }
    })
}
