//! In-memory distributed lock.
//!
//! Clients created with [`MemoryLock::client`] share one table, which is how
//! tests simulate several processes contending for the same resource.
//! [`MemoryLock::revoke`] drops a holder as if its lease had expired and been
//! taken over, and [`MemoryLock::set_unavailable`] simulates a partitioned
//! backing store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::LockError;

use super::{DistributedLock, LockToken};

#[derive(Debug)]
struct Entry {
    value: String,
    holder_id: String,
    expires_at: Instant,
}

#[derive(Default)]
struct Shared {
    entries: Mutex<HashMap<String, Entry>>,
    unavailable: AtomicBool,
}

/// Lock client over a shared in-memory table.
#[derive(Clone)]
pub struct MemoryLock {
    shared: Arc<Shared>,
    holder_id: String,
}

impl MemoryLock {
    pub fn new(holder_id: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            holder_id: holder_id.into(),
        }
    }

    /// Another client over the same table, acquiring as `holder_id`.
    pub fn client(&self, holder_id: impl Into<String>) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            holder_id: holder_id.into(),
        }
    }

    /// Forcibly removes the current holder of `resource`.
    pub fn revoke(&self, resource: &str) {
        if let Ok(mut entries) = self.shared.entries.lock() {
            entries.remove(resource);
        }
    }

    /// Holder id of the unexpired lease on `resource`, if any.
    pub fn holder_of(&self, resource: &str) -> Option<String> {
        let entries = self.shared.entries.lock().ok()?;
        entries
            .get(resource)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.holder_id.clone())
    }

    /// Makes every operation fail with a transient error while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn table(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, LockError> {
        if self.shared.unavailable.load(Ordering::SeqCst) {
            return Err(LockError::Unavailable(
                "in-memory lock store marked unavailable".to_string(),
            ));
        }
        self.shared
            .entries
            .lock()
            .map_err(|_| LockError::Unavailable("in-memory lock table poisoned".to_string()))
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn try_acquire(
        &self,
        resource: &str,
        ttl: Duration,
    ) -> Result<Option<LockToken>, LockError> {
        let mut entries = self.table()?;
        let now = Instant::now();
        if entries
            .get(resource)
            .is_some_and(|entry| entry.expires_at > now)
        {
            return Ok(None);
        }

        let token = LockToken::new(resource, &self.holder_id);
        entries.insert(
            resource.to_string(),
            Entry {
                value: token.stored_value(),
                holder_id: token.holder_id.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(Some(token))
    }

    async fn renew(&self, token: &LockToken, ttl: Duration) -> Result<bool, LockError> {
        let mut entries = self.table()?;
        let now = Instant::now();
        match entries.get_mut(&token.resource) {
            Some(entry) if entry.value == token.stored_value() && entry.expires_at > now => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, token: &LockToken) -> Result<(), LockError> {
        let mut entries = self.table()?;
        if entries
            .get(&token.resource)
            .is_some_and(|entry| entry.value == token.stored_value())
        {
            entries.remove(&token.resource);
        }
        Ok(())
    }

    fn holder_id(&self) -> &str {
        &self.holder_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_exclusive_acquire() {
        let a = MemoryLock::new("node-a");
        let b = a.client("node-b");

        let token = a.try_acquire("consumer", TTL).await.unwrap().unwrap();
        assert!(b.try_acquire("consumer", TTL).await.unwrap().is_none());
        assert_eq!(a.holder_of("consumer"), Some(token.holder_id.clone()));

        // Different resources do not contend.
        assert!(b.try_acquire("other", TTL).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expiry_allows_takeover() {
        let a = MemoryLock::new("node-a");
        let b = a.client("node-b");

        let short = Duration::from_millis(30);
        let stale = a.try_acquire("consumer", short).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let fresh = b.try_acquire("consumer", TTL).await.unwrap().unwrap();
        assert!(!a.renew(&stale, TTL).await.unwrap());
        // A stale release must not remove the new holder.
        a.release(&stale).await.unwrap();
        assert!(b.renew(&fresh, TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_then_reacquire() {
        let a = MemoryLock::new("node-a");
        let b = a.client("node-b");
        let token = a.try_acquire("consumer", TTL).await.unwrap().unwrap();
        a.release(&token).await.unwrap();
        assert!(b.try_acquire("consumer", TTL).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_revoke_loses_lock() {
        let a = MemoryLock::new("node-a");
        let token = a.try_acquire("consumer", TTL).await.unwrap().unwrap();
        a.revoke("consumer");
        assert!(!a.renew(&token, TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_is_transient() {
        let a = MemoryLock::new("node-a");
        a.set_unavailable(true);
        let err = a.try_acquire("consumer", TTL).await.unwrap_err();
        assert!(err.is_transient());
    }
}
