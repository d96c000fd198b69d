//! Units of work travelling through the pool.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::store::Job;
use crate::transform::CompiledScript;

use super::unit::UnitOutcome;

/// A claimed job paired with the instrumented plugin that runs it.
#[derive(Debug, Clone)]
pub struct WorkerTask {
    pub job: Job,
    pub script: Arc<CompiledScript>,
}

impl WorkerTask {
    pub fn new(job: Job, script: Arc<CompiledScript>) -> Self {
        Self { job, script }
    }

    /// Execution budget, fixed per task kind.
    pub fn budget(&self) -> Duration {
        self.script.budget
    }
}

/// What happened to one task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    pub job_id: Uuid,
    pub task_kind: String,
    pub outcome: UnitOutcome,
    /// Slot that ran the task; `None` if the slot vanished.
    pub slot: Option<usize>,
    pub elapsed: Duration,
    /// Whether the unit was replaced after this task.
    pub recycled: bool,
}

/// Result of [`WorkerPool::submit`](super::WorkerPool::submit).
#[derive(Debug)]
pub enum Submission {
    /// The task holds a slot; await the handle for its report.
    Accepted(TaskHandle),
    /// Every slot is taken. The task is handed back untouched.
    Saturated(WorkerTask),
}

impl Submission {
    pub fn is_saturated(&self) -> bool {
        matches!(self, Submission::Saturated(_))
    }
}

/// Resolves to the task's [`TaskReport`] once its unit finishes.
#[derive(Debug)]
pub struct TaskHandle {
    pub(crate) job_id: Uuid,
    pub(crate) task_kind: String,
    pub(crate) rx: oneshot::Receiver<TaskReport>,
}

impl TaskHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }
}

impl Future for TaskHandle {
    type Output = TaskReport;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(report)) => Poll::Ready(report),
            // The slot task died without reporting.
            Poll::Ready(Err(_)) => Poll::Ready(TaskReport {
                job_id: self.job_id,
                task_kind: self.task_kind.clone(),
                outcome: UnitOutcome::Crashed {
                    reason: "worker slot terminated before reporting".to_string(),
                },
                slot: None,
                elapsed: Duration::ZERO,
                recycled: false,
            }),
            Poll::Pending => Poll::Pending,
        }
    }
}
