//! Redis-backed distributed lock.
//!
//! - acquire: `SET key value NX PX ttl`
//! - renew: Lua script, `PEXPIRE` only if `GET key == value`
//! - release: Lua script, `DEL` only if `GET key == value`
//!
//! Both scripts run atomically on the server, which is what makes renew and
//! release safe against a holder whose lease already lapsed.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::debug;

use crate::error::LockError;

use super::{DistributedLock, LockToken};

/// Key prefix for all lock keys.
pub const KEY_PREFIX: &str = "plugin-runner:lock";

const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// Lock client over a Redis connection manager.
pub struct RedisLock {
    /// Reconnects automatically; cloned per command.
    redis: ConnectionManager,
    holder_id: String,
    renew_script: Script,
    release_script: Script,
}

impl RedisLock {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `holder_id` - Identifier of this process in lock values
    pub async fn connect(redis_url: &str, holder_id: impl Into<String>) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| LockError::Unavailable(format!("invalid Redis URL: {e}")))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| LockError::Unavailable(format!("connect failed: {e}")))?;
        Ok(Self::from_connection(redis, holder_id))
    }

    /// Useful when sharing a connection manager across components.
    pub fn from_connection(redis: ConnectionManager, holder_id: impl Into<String>) -> Self {
        Self {
            redis,
            holder_id: holder_id.into(),
            renew_script: Script::new(RENEW_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        }
    }

    pub fn key_for(resource: &str) -> String {
        format!("{KEY_PREFIX}:{resource}")
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn try_acquire(
        &self,
        resource: &str,
        ttl: Duration,
    ) -> Result<Option<LockToken>, LockError> {
        let token = LockToken::new(resource, &self.holder_id);
        let mut conn = self.redis.clone();

        let reply: Option<String> = redis::cmd("SET")
            .arg(Self::key_for(resource))
            .arg(token.stored_value())
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;

        if reply.is_some() {
            debug!(resource, holder = %self.holder_id, "Acquired Redis lock");
            Ok(Some(token))
        } else {
            Ok(None)
        }
    }

    async fn renew(&self, token: &LockToken, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.redis.clone();
        let extended: i64 = self
            .renew_script
            .key(Self::key_for(&token.resource))
            .arg(token.stored_value())
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn release(&self, token: &LockToken) -> Result<(), LockError> {
        let mut conn = self.redis.clone();
        let deleted: i64 = self
            .release_script
            .key(Self::key_for(&token.resource))
            .arg(token.stored_value())
            .invoke_async(&mut conn)
            .await?;
        if deleted == 0 {
            debug!(resource = %token.resource, "Release skipped: lock no longer held");
        }
        Ok(())
    }

    fn holder_id(&self) -> &str {
        &self.holder_id
    }
}
