//! Exponential backoff for job retries and store-operation retries.
//!
//! Delays are `initial * factor^attempt`, capped at `max`. Jitter is a
//! deterministic multiplier derived from a seed (the job id, or the failure
//! time), so the same failure always schedules the same delay.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::StoreError;
use crate::metrics;

/// Exponential backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub factor: f64,
    /// Relative spread: the delay is scaled into `[1 - jitter, 1 + jitter)`.
    pub jitter: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300))
    }
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = if factor.is_finite() { factor.max(1.0) } else { 2.0 };
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 };
        self
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let millis = self.initial.as_millis() as f64 * self.factor.powi(exponent);
        self.cap(millis)
    }

    /// Delay with jitter drawn deterministically from `seed`.
    pub fn delay_with_seed(&self, attempt: u32, seed: u64) -> Duration {
        let base = self.delay(attempt);
        if self.jitter == 0.0 {
            return base;
        }
        let mut mixed = seed ^ (u64::from(attempt) << 32);
        mixed = mixed.wrapping_mul(6364136223846793005).wrapping_add(1);
        let frac = ((mixed >> 32) as f64) / (u32::MAX as f64 + 1.0);
        let multiplier = 1.0 - self.jitter + 2.0 * self.jitter * frac;
        self.cap(base.as_millis() as f64 * multiplier)
    }

    /// Delay for a job's next attempt; `attempts` is its failures so far.
    pub fn delay_for_job(&self, job_id: Uuid, attempts: u32) -> Duration {
        let bits = job_id.as_u128();
        let seed = (bits as u64) ^ ((bits >> 64) as u64);
        self.delay_with_seed(attempts, seed)
    }

    fn cap(&self, millis: f64) -> Duration {
        let max = self.max.as_millis() as f64;
        if !millis.is_finite() || millis >= max {
            return self.max;
        }
        Duration::from_millis(millis.max(0.0).round() as u64)
    }
}

/// Runs a store operation, retrying transient failures with backoff.
///
/// Gives up after `max_attempts` tries or on the first permanent error.
/// Callers stop an unbounded retry loop by dropping the future.
pub async fn retry_transient<T, F, Fut>(
    operation: &'static str,
    policy: &ExponentialBackoff,
    max_attempts: u32,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                metrics::record_store_error(operation);
                attempt = attempt.saturating_add(1);
                if !e.is_transient() || attempt >= max_attempts {
                    return Err(e);
                }
                let seed = Utc::now().timestamp_millis() as u64;
                let delay = policy.delay_with_seed(attempt - 1, seed);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Store operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
