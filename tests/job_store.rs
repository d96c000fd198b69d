//! Job store contract tests.
//!
//! Every property runs against the in-memory store. The same bodies run
//! against Postgres when a database is available:
//! `DATABASE_URL=postgres://... cargo test --test job_store -- --ignored`

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use plugin_runner::store::{
    JobStatus, JobStore, MemoryJobStore, NewJob, PostgresJobStore, RetryOutcome,
};
use uuid::Uuid;

const CLAIMERS: usize = 8;
const JOBS: usize = 200;

/// Every test uses its own queue so runs against a shared database do not
/// see each other's jobs.
fn unique_queue() -> String {
    format!("test-{}", Uuid::new_v4().simple())
}

async fn exclusive_claims(store: Arc<dyn JobStore>) {
    let queue = unique_queue();
    for i in 0..JOBS {
        store
            .enqueue(NewJob::new("echo", serde_json::json!({ "i": i })).with_queue(&queue))
            .await
            .unwrap();
    }

    let mut claimers = Vec::new();
    for _ in 0..CLAIMERS {
        let store = Arc::clone(&store);
        let queue = queue.clone();
        claimers.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            loop {
                let batch = store.claim_next(&queue, 7).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                claimed.extend(batch.into_iter().map(|job| job.id));
                tokio::task::yield_now().await;
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for claimer in claimers {
        for id in claimer.await.unwrap() {
            total += 1;
            assert!(seen.insert(id), "job {id} was claimed twice");
        }
    }
    assert_eq!(total, JOBS);

    let stats = store.stats(&queue).await.unwrap();
    assert_eq!(stats.claimed, JOBS as u64);
    assert_eq!(stats.pending, 0);
}

async fn idempotent_ack(store: Arc<dyn JobStore>) {
    let queue = unique_queue();
    let id = store
        .enqueue(NewJob::new("echo", serde_json::Value::Null).with_queue(&queue))
        .await
        .unwrap();
    store.claim_next(&queue, 1).await.unwrap();

    store.ack(id).await.unwrap();
    let once = store.get(id).await.unwrap().unwrap();
    store.ack(id).await.unwrap();
    let twice = store.get(id).await.unwrap().unwrap();

    assert_eq!(once.status, JobStatus::Succeeded);
    assert_eq!(once, twice);
    assert_eq!(store.stats(&queue).await.unwrap().succeeded, 1);

    // Settling an acked job again changes nothing either.
    assert_eq!(
        store.retry(id, Duration::ZERO, "late").await.unwrap(),
        RetryOutcome::NotClaimed
    );
    assert!(!store.fail(id, "late").await.unwrap());
    assert_eq!(store.get(id).await.unwrap().unwrap(), once);
}

async fn bounded_retries(store: Arc<dyn JobStore>) {
    let queue = unique_queue();
    let id = store
        .enqueue(
            NewJob::new("flaky", serde_json::Value::Null)
                .with_queue(&queue)
                .with_max_attempts(3),
        )
        .await
        .unwrap();

    let mut outcomes = Vec::new();
    loop {
        let claimed = store.claim_next(&queue, 1).await.unwrap();
        let Some(job) = claimed.into_iter().next() else {
            break;
        };
        assert_eq!(job.id, id);
        outcomes.push(store.retry(id, Duration::ZERO, "handler threw").await.unwrap());
        assert!(outcomes.len() <= 3, "job retried past max_attempts");
    }

    assert!(matches!(outcomes[0], RetryOutcome::Rescheduled { attempts: 1, .. }));
    assert!(matches!(outcomes[1], RetryOutcome::Rescheduled { attempts: 2, .. }));
    assert_eq!(outcomes[2], RetryOutcome::Exhausted { attempts: 3 });

    let failed = store.failed_jobs(&queue, 10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, id);
    assert_eq!(failed[0].attempts, 3);
    assert_eq!(failed[0].last_error.as_deref(), Some("handler threw"));
}

async fn delayed_jobs_wait(store: Arc<dyn JobStore>) {
    let queue = unique_queue();
    store
        .enqueue(
            NewJob::new("later", serde_json::Value::Null)
                .with_queue(&queue)
                .with_delay(Duration::from_secs(3600)),
        )
        .await
        .unwrap();
    let now = store
        .enqueue(NewJob::new("now", serde_json::Value::Null).with_queue(&queue))
        .await
        .unwrap();

    let claimed = store.claim_next(&queue, 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, now);
    assert_eq!(store.stats(&queue).await.unwrap().pending, 1);
}

async fn stale_claims_are_recovered(store: Arc<dyn JobStore>) {
    let queue = unique_queue();
    let id = store
        .enqueue(NewJob::new("echo", serde_json::Value::Null).with_queue(&queue))
        .await
        .unwrap();
    store.claim_next(&queue, 1).await.unwrap();

    let report = store.reclaim_stale(&queue, Duration::from_secs(60)).await.unwrap();
    assert_eq!(report.total(), 0, "fresh claims are left alone");

    tokio::time::sleep(Duration::from_millis(50)).await;
    let report = store.reclaim_stale(&queue, Duration::from_millis(10)).await.unwrap();
    assert_eq!(report.requeued, 1);

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert_eq!(store.claim_next(&queue, 1).await.unwrap()[0].id, id);
}

fn memory() -> Arc<dyn JobStore> {
    Arc::new(MemoryJobStore::new())
}

async fn postgres() -> Arc<dyn JobStore> {
    let url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL environment variable must be set for Postgres tests");
    let store = PostgresJobStore::connect(&url, CLAIMERS as u32 + 2)
        .await
        .expect("connect to Postgres");
    store.run_migrations().await.expect("migrations");
    Arc::new(store)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_memory_concurrent_claims_are_exclusive() {
    exclusive_claims(memory()).await;
}

#[tokio::test]
async fn test_memory_ack_is_idempotent() {
    idempotent_ack(memory()).await;
}

#[tokio::test]
async fn test_memory_retries_are_bounded() {
    bounded_retries(memory()).await;
}

#[tokio::test]
async fn test_memory_delayed_jobs_wait() {
    delayed_jobs_wait(memory()).await;
}

#[tokio::test]
async fn test_memory_stale_claims_are_recovered() {
    stale_claims_are_recovered(memory()).await;
}

#[tokio::test]
async fn test_memory_outage_is_transient() {
    let store = MemoryJobStore::new();
    store.set_unavailable(true);
    let err = store.claim_next("default", 1).await.unwrap_err();
    assert!(err.is_transient());
    store.set_unavailable(false);
    assert!(store.claim_next("default", 1).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // Run with: DATABASE_URL=... cargo test --test job_store -- --ignored
async fn test_postgres_concurrent_claims_are_exclusive() {
    exclusive_claims(postgres().await).await;
}

#[tokio::test]
#[ignore]
async fn test_postgres_ack_is_idempotent() {
    idempotent_ack(postgres().await).await;
}

#[tokio::test]
#[ignore]
async fn test_postgres_retries_are_bounded() {
    bounded_retries(postgres().await).await;
}

#[tokio::test]
#[ignore]
async fn test_postgres_delayed_jobs_wait() {
    delayed_jobs_wait(postgres().await).await;
}

#[tokio::test]
#[ignore]
async fn test_postgres_stale_claims_are_recovered() {
    stale_claims_are_recovered(postgres().await).await;
}

#[tokio::test]
#[ignore]
async fn test_postgres_migrations_are_idempotent() {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let store = PostgresJobStore::connect(&url, 2).await.unwrap();
    store.run_migrations().await.unwrap();
    assert_eq!(store.run_migrations().await.unwrap(), 0);
}
