//! Fleet-wide mutual exclusion over a named resource.
//!
//! The contract is a compare-and-swap on a holder token: `try_acquire`
//! succeeds only when no unexpired holder exists, and `renew`/`release` act
//! only while the caller's token is still the stored one. Any store offering
//! atomic conditional writes with expiry can implement it.
//!
//! A `renew` returning `false` means the lock is gone (expired, stolen or
//! revoked) and another process may already be doing the protected work.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::LockError;

pub use self::memory::MemoryLock;
pub use self::redis::RedisLock;

/// Proof of one successful acquisition.
///
/// Owned by the component that acquired it and never shared across
/// processes; a new acquisition always yields a new `token`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub resource: String,
    pub holder_id: String,
    /// Unique per acquisition.
    pub token: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockToken {
    pub fn new(resource: impl Into<String>, holder_id: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            holder_id: holder_id.into(),
            token: Uuid::new_v4().to_string(),
            acquired_at: Utc::now(),
        }
    }

    /// Value stored in the backing store: holder id and token, so an
    /// operator inspecting the key can see who holds it.
    pub fn stored_value(&self) -> String {
        format!("{}:{}", self.holder_id, self.token)
    }
}

/// Renewable, TTL-based lock keyed by resource name.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Returns a token if the resource was free (or its holder expired).
    async fn try_acquire(&self, resource: &str, ttl: Duration)
        -> Result<Option<LockToken>, LockError>;

    /// Extends the expiry to `ttl` from now if `token` is still the holder.
    async fn renew(&self, token: &LockToken, ttl: Duration) -> Result<bool, LockError>;

    /// Best-effort early release; a no-op when `token` no longer holds.
    async fn release(&self, token: &LockToken) -> Result<(), LockError>;

    /// Identifier this client acquires under.
    fn holder_id(&self) -> &str;
}

/// Holder identifier for this process: pid plus a random suffix, so two
/// processes on one host (or a restarted process) never collide.
pub fn default_holder_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", std::process::id(), &suffix[..8])
}
