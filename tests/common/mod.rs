//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use plugin_runner::error::{LockError, PoolError};
use plugin_runner::lock::{DistributedLock, LockToken, MemoryLock};
use plugin_runner::orchestrator::{ExponentialBackoff, OrchestratorConfig};
use plugin_runner::plugins::PluginRegistry;
use plugin_runner::pool::{ExecutionUnit, PoolConfig, UnitFactory, UnitOutcome, WorkerPool, WorkerTask};

/// Counts concurrent and total executions across every unit of a pool.
#[derive(Debug, Default)]
pub struct Tally {
    pub running: AtomicUsize,
    pub peak: AtomicUsize,
    pub executions: AtomicUsize,
}

impl Tally {
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Sleeps for `delay`, then succeeds unless the payload has `"fail": true`.
pub struct ScriptedUnit {
    delay: Duration,
    tally: Arc<Tally>,
}

#[async_trait]
impl ExecutionUnit for ScriptedUnit {
    async fn execute(&mut self, task: &WorkerTask, _deadline: Instant) -> UnitOutcome {
        self.tally.executions.fetch_add(1, Ordering::SeqCst);
        let now = self.tally.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.tally.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;
        self.tally.running.fetch_sub(1, Ordering::SeqCst);

        if task.job.payload["fail"].as_bool().unwrap_or(false) {
            UnitOutcome::Failed {
                message: "transient handler error".into(),
            }
        } else {
            UnitOutcome::Completed(task.job.payload.clone())
        }
    }
}

pub fn scripted_factory(delay: Duration) -> (Arc<dyn UnitFactory>, Arc<Tally>) {
    let tally = Arc::new(Tally::default());
    let shared = Arc::clone(&tally);
    let factory = move |_slot: usize| -> Result<Box<dyn ExecutionUnit>, PoolError> {
        Ok(Box::new(ScriptedUnit {
            delay,
            tally: Arc::clone(&shared),
        }))
    };
    (Arc::new(factory), tally)
}

pub fn scripted_pool(capacity: usize, delay: Duration) -> (Arc<WorkerPool>, Arc<Tally>) {
    let (factory, tally) = scripted_factory(delay);
    let pool = WorkerPool::new(PoolConfig::new(capacity), factory).expect("pool");
    (Arc::new(pool), tally)
}

/// Orchestrator settings scaled down to test time.
pub fn fast_config() -> OrchestratorConfig {
    let quick = ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(5));
    OrchestratorConfig::new("default")
        .with_lock_ttl(Duration::from_millis(300))
        .with_acquire_interval(Duration::from_millis(10))
        .with_poll_interval(Duration::from_millis(5))
        .with_drain_grace(Duration::from_secs(2))
        .with_retry_backoff(quick)
        .with_store_backoff(quick)
}

pub fn echo_registry() -> Arc<PluginRegistry> {
    let mut registry = PluginRegistry::new();
    registry.register("echo", "function run(p) { return p; }", Duration::from_secs(1));
    Arc::new(registry)
}

/// Polls `condition` every 5ms; panics after 5s.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Acquires and releases through a [`MemoryLock`]; renewals never answer,
/// like a lock store behind a network partition.
pub struct UnresponsiveRenewals(pub MemoryLock);

#[async_trait]
impl DistributedLock for UnresponsiveRenewals {
    async fn try_acquire(&self, resource: &str, ttl: Duration) -> Result<Option<LockToken>, LockError> {
        self.0.try_acquire(resource, ttl).await
    }

    async fn renew(&self, _token: &LockToken, _ttl: Duration) -> Result<bool, LockError> {
        std::future::pending().await
    }

    async fn release(&self, token: &LockToken) -> Result<(), LockError> {
        self.0.release(token).await
    }

    fn holder_id(&self) -> &str {
        self.0.holder_id()
    }
}
