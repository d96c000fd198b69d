//! Worker pool saturation behavior.

mod common;

use std::sync::Arc;
use std::time::Duration;

use plugin_runner::pool::{PoolState, Submission, WorkerTask};
use plugin_runner::store::{JobStore, MemoryJobStore, NewJob};
use plugin_runner::transform::CodeTransformer;

use common::scripted_pool;

async fn tasks(count: usize) -> Vec<WorkerTask> {
    let store = MemoryJobStore::new();
    for i in 0..count {
        store
            .enqueue(NewJob::new("echo", serde_json::json!({ "i": i })))
            .await
            .unwrap();
    }
    let script = Arc::new(CodeTransformer::new(Duration::from_secs(1)).compile("").unwrap());
    store
        .claim_next("default", count)
        .await
        .unwrap()
        .into_iter()
        .map(|job| WorkerTask::new(job, Arc::clone(&script)))
        .collect()
}

#[tokio::test]
async fn test_fifth_submission_is_rejected_at_capacity_four() {
    let (pool, tally) = scripted_pool(4, Duration::from_millis(200));
    let mut handles = Vec::new();
    let mut first_saturated = None;

    for (n, task) in tasks(10).await.into_iter().enumerate() {
        match pool.submit(task).unwrap() {
            Submission::Accepted(handle) => handles.push(handle),
            Submission::Saturated(returned) => {
                first_saturated.get_or_insert(n + 1);
                // The task comes back intact for the caller to retry later.
                assert_eq!(returned.job.task_kind, "echo");
            }
        }
    }

    assert_eq!(first_saturated, Some(5));
    assert_eq!(handles.len(), 4);
    assert_eq!(pool.state().in_flight, 4);

    for handle in handles {
        assert!(handle.await.outcome.failure(Duration::ZERO).is_none());
    }
    assert!(tally.peak() <= 4, "peak concurrency {}", tally.peak());
    assert_eq!(pool.stats().saturated, 6);
}

#[tokio::test]
async fn test_producer_that_waits_for_drain_never_exceeds_capacity() {
    let (pool, tally) = scripted_pool(4, Duration::from_millis(20));
    let mut states = pool.subscribe();
    let watcher = tokio::spawn(async move {
        let mut peak = 0;
        // Stops once the pool has been quiet for a while.
        while let Ok(Ok(())) = tokio::time::timeout(Duration::from_millis(200), states.changed()).await {
            let state: PoolState = *states.borrow();
            peak = peak.max(state.in_flight);
        }
        peak
    });

    let mut handles = Vec::new();
    let mut pending: Vec<WorkerTask> = tasks(20).await;
    pending.reverse();
    while let Some(task) = pending.pop() {
        match pool.submit(task).unwrap() {
            Submission::Accepted(handle) => handles.push(handle),
            Submission::Saturated(task) => {
                pending.push(task);
                pool.wait_for_drain().await;
            }
        }
    }
    for handle in handles {
        handle.await;
    }

    assert_eq!(tally.executions(), 20);
    assert!(tally.peak() <= 4);
    assert!(pool.stats().saturated > 0);

    assert!(pool.shutdown(Duration::from_secs(1)).await);
    let observed_peak = watcher.await.unwrap();
    assert!(observed_peak <= 4, "published in_flight reached {observed_peak}");
}
