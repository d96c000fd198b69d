//! Lock renewal loop.
//!
//! Renews the consumer lock every `ttl / 3`. A renewal the lock store
//! refuses is a lock loss. A renewal that fails at the transport level is
//! retried until the expiry last confirmed by the store would pass; from
//! then on another process may hold the lock, so it counts as lost too.
//! Each renewal call is bounded by that expiry, so a store that never
//! answers cannot keep the lease alive.
//!
//! On loss the loop cancels the `lost` token and exits. On `stop` it
//! releases the lock and exits.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::lock::{DistributedLock, LockToken};
use crate::metrics::{self, LockEvent};

use super::OrchestratorEvent;

/// Shortest interval between renewal attempts.
const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// How the renewal loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalExit {
    /// Stopped on request; the lock was released (best effort).
    Released,
    Lost,
}

pub fn renewal_interval(ttl: Duration) -> Duration {
    (ttl / 3).max(MIN_INTERVAL)
}

pub fn spawn_renewal(
    lock: Arc<dyn DistributedLock>,
    token: LockToken,
    ttl: Duration,
    acquired: Instant,
    lost: CancellationToken,
    stop: CancellationToken,
    events: broadcast::Sender<OrchestratorEvent>,
) -> JoinHandle<RenewalExit> {
    tokio::spawn(async move {
        let interval = renewal_interval(ttl);
        let mut confirmed_until = acquired + ttl;

        loop {
            let wait = interval.min(confirmed_until.saturating_duration_since(Instant::now()));
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    if let Err(e) = lock.release(&token).await {
                        warn!(resource = %token.resource, error = %e, "Failed to release lock; it will expire");
                    } else {
                        info!(resource = %token.resource, "Lock released");
                    }
                    metrics::record_lock_event(LockEvent::Released);
                    return RenewalExit::Released;
                }
                _ = tokio::time::sleep(wait.max(MIN_INTERVAL)) => {}
            }

            let attempted = Instant::now();
            if attempted >= confirmed_until {
                warn!(resource = %token.resource, "Lock expired before it could be renewed; lock lost");
                return lose(&token, &lost, &events);
            }
            let renewed = tokio::time::timeout_at(confirmed_until, lock.renew(&token, ttl)).await;
            let Ok(renewed) = renewed else {
                metrics::record_lock_event(LockEvent::RenewError);
                warn!(resource = %token.resource, "Lock renewal did not answer before expiry; lock lost");
                return lose(&token, &lost, &events);
            };
            match renewed {
                Ok(true) => {
                    confirmed_until = attempted + ttl;
                    metrics::record_lock_event(LockEvent::Renewed);
                    debug!(resource = %token.resource, "Lock renewed");
                    continue;
                }
                Ok(false) => {
                    warn!(resource = %token.resource, "Lock renewal refused; lock lost");
                }
                Err(e) => {
                    metrics::record_lock_event(LockEvent::RenewError);
                    if Instant::now() < confirmed_until {
                        warn!(
                            resource = %token.resource,
                            error = %e,
                            remaining_ms = confirmed_until.saturating_duration_since(Instant::now()).as_millis() as u64,
                            "Lock renewal failed, retrying before expiry"
                        );
                        continue;
                    }
                    warn!(resource = %token.resource, error = %e, "Lock expired while renewal kept failing; lock lost");
                }
            }

            return lose(&token, &lost, &events);
        }
    })
}

fn lose(
    token: &LockToken,
    lost: &CancellationToken,
    events: &broadcast::Sender<OrchestratorEvent>,
) -> RenewalExit {
    metrics::record_lock_event(LockEvent::Lost);
    lost.cancel();
    let _ = events.send(OrchestratorEvent::LockLost {
        resource: token.resource.clone(),
    });
    RenewalExit::Lost
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LockError;
    use crate::lock::MemoryLock;
    use async_trait::async_trait;

    /// Acquires and releases normally; renewals never get an answer.
    struct UnresponsiveRenewals(MemoryLock);

    #[async_trait]
    impl DistributedLock for UnresponsiveRenewals {
        async fn try_acquire(
            &self,
            resource: &str,
            ttl: Duration,
        ) -> Result<Option<LockToken>, LockError> {
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

    fn start(
        lock: &MemoryLock,
        token: LockToken,
        ttl: Duration,
    ) -> (CancellationToken, CancellationToken, JoinHandle<RenewalExit>) {
        let lost = CancellationToken::new();
        let stop = CancellationToken::new();
        let (events, _) = broadcast::channel(8);
        let handle = spawn_renewal(
            Arc::new(lock.clone()),
            token,
            ttl,
            Instant::now(),
            lost.clone(),
            stop.clone(),
            events,
        );
        (lost, stop, handle)
    }

    #[test]
    fn test_interval_is_a_third_of_ttl() {
        assert_eq!(renewal_interval(Duration::from_secs(15)), Duration::from_secs(5));
        assert_eq!(renewal_interval(Duration::from_millis(3)), MIN_INTERVAL);
    }

    #[tokio::test]
    async fn test_renewal_keeps_lock_alive_then_releases() {
        let lock = MemoryLock::new("node-a");
        let ttl = Duration::from_millis(90);
        let token = lock.try_acquire("job-consumer", ttl).await.unwrap().unwrap();
        let (lost, stop, handle) = start(&lock, token, ttl);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(lock.holder_of("job-consumer").as_deref(), Some("node-a"));
        assert!(!lost.is_cancelled());

        stop.cancel();
        assert_eq!(handle.await.unwrap(), RenewalExit::Released);
        assert_eq!(lock.holder_of("job-consumer"), None);
    }

    #[tokio::test]
    async fn test_revoked_lock_is_lost() {
        let lock = MemoryLock::new("node-a");
        let ttl = Duration::from_millis(90);
        let token = lock.try_acquire("job-consumer", ttl).await.unwrap().unwrap();
        let (lost, _stop, handle) = start(&lock, token, ttl);

        lock.revoke("job-consumer");
        let exit = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("renewal should notice the loss")
            .unwrap();
        assert_eq!(exit, RenewalExit::Lost);
        assert!(lost.is_cancelled());
    }

    #[tokio::test]
    async fn test_transport_errors_lose_lock_at_expiry() {
        let lock = MemoryLock::new("node-a");
        let ttl = Duration::from_millis(120);
        let token = lock.try_acquire("job-consumer", ttl).await.unwrap().unwrap();
        let (lost, _stop, handle) = start(&lock, token, ttl);

        lock.set_unavailable(true);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!lost.is_cancelled(), "lock is still within its confirmed TTL");

        let exit = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("renewal should give up at expiry")
            .unwrap();
        assert_eq!(exit, RenewalExit::Lost);
    }

    #[tokio::test]
    async fn test_unanswered_renewal_loses_lock_at_expiry() {
        let memory = MemoryLock::new("node-a");
        let ttl = Duration::from_millis(150);
        let token = memory.try_acquire("job-consumer", ttl).await.unwrap().unwrap();
        let lost = CancellationToken::new();
        let (events, _) = broadcast::channel(8);
        let started = Instant::now();
        let handle = spawn_renewal(
            Arc::new(UnresponsiveRenewals(memory.clone())),
            token,
            ttl,
            started,
            lost.clone(),
            CancellationToken::new(),
            events,
        );

        let exit = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("renewal should give up at expiry")
            .unwrap();
        assert_eq!(exit, RenewalExit::Lost);
        assert!(lost.is_cancelled());
        assert!(started.elapsed() < ttl + Duration::from_millis(100));

        // The lease has lapsed in the store, so another node may now hold it.
        let other = memory.client("node-b");
        assert!(other.try_acquire("job-consumer", ttl).await.unwrap().is_some());
    }
}
