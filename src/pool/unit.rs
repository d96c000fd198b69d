//! Isolated execution units.
//!
//! A unit runs one task at a time and shares no mutable state with its
//! siblings. After a timeout, crash or forced cancellation the pool throws
//! the unit away and asks the factory for a fresh one, so nothing a runaway
//! plugin left behind can reach the next task.

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::{JobFailure, PoolError};

use super::task::WorkerTask;

/// How a unit finished a task.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    /// The plugin returned a value.
    Completed(serde_json::Value),
    /// The plugin threw (or rejected) with something other than a timeout.
    Failed { message: String },
    /// The budget ran out, cooperatively or at the hard deadline.
    TimedOut,
    /// The unit died or produced no usable reply.
    Crashed { reason: String },
    /// The pool aborted the task; its job stays claimed.
    Cancelled,
}

impl UnitOutcome {
    /// Label used in metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            UnitOutcome::Completed(_) => "succeeded",
            UnitOutcome::Failed { .. } => "failed",
            UnitOutcome::TimedOut => "timed_out",
            UnitOutcome::Crashed { .. } => "crashed",
            UnitOutcome::Cancelled => "cancelled",
        }
    }

    /// Whether the unit may carry state from this task and must be replaced.
    pub fn requires_recycle(&self) -> bool {
        matches!(
            self,
            UnitOutcome::TimedOut | UnitOutcome::Crashed { .. } | UnitOutcome::Cancelled
        )
    }

    /// Failure to record against the job, if any.
    pub fn failure(&self, budget: std::time::Duration) -> Option<JobFailure> {
        match self {
            UnitOutcome::Completed(_) | UnitOutcome::Cancelled => None,
            UnitOutcome::Failed { message } => Some(JobFailure::Handler(message.clone())),
            UnitOutcome::TimedOut => Some(JobFailure::ExecutionTimeout { budget }),
            UnitOutcome::Crashed { reason } => Some(JobFailure::ExecutionUnitCrash(reason.clone())),
        }
    }
}

/// An isolated runtime able to execute one task at a time.
#[async_trait]
pub trait ExecutionUnit: Send {
    /// Runs `task`, giving up no later than `deadline`.
    ///
    /// Dropping the returned future must stop the execution; the pool does
    /// that when it aborts in-flight work.
    async fn execute(&mut self, task: &WorkerTask, deadline: Instant) -> UnitOutcome;

    /// Releases resources before the unit is discarded.
    async fn shutdown(&mut self) {}
}

/// Creates fresh units for pool slots.
pub trait UnitFactory: Send + Sync + 'static {
    fn create(&self, slot: usize) -> Result<Box<dyn ExecutionUnit>, PoolError>;
}

impl<F> UnitFactory for F
where
    F: Fn(usize) -> Result<Box<dyn ExecutionUnit>, PoolError> + Send + Sync + 'static,
{
    fn create(&self, slot: usize) -> Result<Box<dyn ExecutionUnit>, PoolError> {
        self(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_outcome_labels_and_recycle() {
        assert_eq!(UnitOutcome::Completed(serde_json::Value::Null).label(), "succeeded");
        assert!(!UnitOutcome::Completed(serde_json::Value::Null).requires_recycle());
        assert!(!UnitOutcome::Failed { message: "x".into() }.requires_recycle());
        assert!(UnitOutcome::TimedOut.requires_recycle());
        assert!(UnitOutcome::Cancelled.requires_recycle());
        assert!(UnitOutcome::Crashed { reason: "oom".into() }.requires_recycle());
    }

    #[test]
    fn test_outcome_failures() {
        let budget = Duration::from_millis(50);
        assert_eq!(UnitOutcome::Cancelled.failure(budget), None);
        assert_eq!(
            UnitOutcome::TimedOut.failure(budget),
            Some(JobFailure::ExecutionTimeout { budget })
        );
        assert!(UnitOutcome::Crashed { reason: "oom".into() }
            .failure(budget)
            .is_some_and(|f| f.is_retryable()));
    }
}
