//! Orchestrator lifecycle states and guarded transitions.
//!
//! ```text
//! Idle -> AcquiringLock -> Running(Active <-> Paused) -> Draining -> Stopped
//!               \------------------------------------------------/
//!                      (shutdown before the lock was acquired)
//! ```

use std::fmt;

use tokio::sync::{broadcast, watch};
use tracing::info;

use crate::error::OrchestratorError;
use crate::metrics;

use super::OrchestratorEvent;

/// Sub-state of `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunMode {
    /// Claiming and dispatching.
    Active,
    /// The pool is saturated; claiming waits for it to drain. The lock is
    /// still renewed.
    Paused,
}

/// Why the orchestrator stopped taking work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopReason {
    Shutdown,
    LockLost,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Shutdown => f.write_str("shutdown"),
            StopReason::LockLost => f.write_str("lock lost"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrchestratorState {
    Idle,
    AcquiringLock,
    Running(RunMode),
    Draining(StopReason),
    Stopped,
}

impl OrchestratorState {
    pub fn can_transition_to(&self, next: &OrchestratorState) -> bool {
        use OrchestratorState::*;
        match (self, next) {
            (Idle, AcquiringLock) => true,
            (AcquiringLock, Running(RunMode::Active)) => true,
            (AcquiringLock, Stopped) => true,
            (Running(current), Running(mode)) => current != mode,
            (Running(_), Draining(_)) => true,
            (Draining(_), Stopped) => true,
            _ => false,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, OrchestratorState::Running(_))
    }

    /// Only `Running(Active)` claims new jobs.
    pub fn accepts_claims(&self) -> bool {
        matches!(self, OrchestratorState::Running(RunMode::Active))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrchestratorState::Stopped)
    }

    /// Numeric code exported as the `orchestrator_state` gauge.
    pub fn code(&self) -> u8 {
        match self {
            OrchestratorState::Idle => 0,
            OrchestratorState::AcquiringLock => 1,
            OrchestratorState::Running(RunMode::Active) => 2,
            OrchestratorState::Running(RunMode::Paused) => 3,
            OrchestratorState::Draining(_) => 4,
            OrchestratorState::Stopped => 5,
        }
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorState::Idle => f.write_str("idle"),
            OrchestratorState::AcquiringLock => f.write_str("acquiring-lock"),
            OrchestratorState::Running(RunMode::Active) => f.write_str("running"),
            OrchestratorState::Running(RunMode::Paused) => f.write_str("running (paused)"),
            OrchestratorState::Draining(reason) => write!(f, "draining ({reason})"),
            OrchestratorState::Stopped => f.write_str("stopped"),
        }
    }
}

/// Holds the current state and publishes every change.
pub(crate) struct StateMachine {
    tx: watch::Sender<OrchestratorState>,
    events: broadcast::Sender<OrchestratorEvent>,
}

impl StateMachine {
    pub(crate) fn new(events: broadcast::Sender<OrchestratorEvent>) -> Self {
        let (tx, _) = watch::channel(OrchestratorState::Idle);
        Self { tx, events }
    }

    pub(crate) fn current(&self) -> OrchestratorState {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<OrchestratorState> {
        self.tx.subscribe()
    }

    pub(crate) fn transition(&self, next: OrchestratorState) -> Result<(), OrchestratorError> {
        let from = self.current();
        if !from.can_transition_to(&next) {
            return Err(OrchestratorError::InvalidTransition {
                from: from.to_string(),
                to: next.to_string(),
            });
        }
        self.tx.send_replace(next);
        metrics::set_orchestrator_state(next.code());
        info!(from = %from, to = %next, "Orchestrator state changed");
        let _ = self.events.send(OrchestratorEvent::StateChanged { from, to: next });
        Ok(())
    }
}
