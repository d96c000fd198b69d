//! Pool utilization as seen by the dispatcher.

use serde::Serialize;

/// Current in-flight tasks versus capacity.
///
/// Mutated only by the pool's own accounting; everyone else reads snapshots
/// published through a `watch` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolState {
    pub in_flight: usize,
    pub capacity: usize,
}

impl PoolState {
    pub fn new(capacity: usize) -> Self {
        Self {
            in_flight: 0,
            capacity,
        }
    }

    pub fn is_saturated(&self) -> bool {
        self.in_flight >= self.capacity
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight == 0
    }

    pub fn free(&self) -> usize {
        self.capacity.saturating_sub(self.in_flight)
    }

    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        self.in_flight as f64 / self.capacity as f64
    }
}

/// Highest in-flight count at which a saturated pool counts as drained.
///
/// `threshold` is a fraction of capacity; the result is always below
/// capacity so that at least one slot is free on resume.
pub fn resume_level(capacity: usize, threshold: f64) -> usize {
    let threshold = if threshold.is_finite() {
        threshold.clamp(0.0, 1.0)
    } else {
        0.5
    };
    let level = (capacity as f64 * threshold).floor() as usize;
    level.min(capacity.saturating_sub(1))
}
