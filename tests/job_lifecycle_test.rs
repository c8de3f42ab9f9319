//! End-to-end test of the durable job queue driving a registered
//! `JobHandler` through the worker pool: enqueue, claim, handle, complete.

use async_trait::async_trait;
use memva::queue::JobQueue;
use memva::storage::{JobListFilter, JobRow, Store};
use memva::worker::{JobHandler, WorkerPool};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio_util::sync::CancellationToken;

struct CountingHandler {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl JobHandler for CountingHandler {
    async fn handle(&self, job: &JobRow) -> anyhow::Result<Option<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(format!("handled {}", job.id)))
    }
}

#[tokio::test]
async fn enqueued_job_runs_through_worker_pool_and_completes() {
    let store = Store::open_in_memory().await.unwrap();
    let queue = JobQueue::new(store.clone());

    let job = queue
        .enqueue("session-runner", r#"{"sessionId":"s1","content":"hi"}"#, 0, 3)
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let handler = Arc::new(CountingHandler { calls: calls.clone() });

    let shutdown = CancellationToken::new();
    let pool = WorkerPool::new(queue.clone(), 2).register("session-runner", handler);
    let handles = pool.spawn(shutdown.clone());

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let row = queue.get(&job.id).await.unwrap().unwrap();
        if row.status == "completed" {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "job never completed");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let row = queue.get(&job.id).await.unwrap().unwrap();
    assert_eq!(row.result.as_deref(), Some(format!("handled {}", job.id).as_str()));

    shutdown.cancel();
    for h in handles {
        let _ = h.await;
    }
}

#[tokio::test]
async fn job_with_no_registered_handler_is_failed() {
    let store = Store::open_in_memory().await.unwrap();
    let queue = JobQueue::new(store.clone());

    let job = queue.enqueue("unknown-type", "{}", 0, 1).await.unwrap();

    let shutdown = CancellationToken::new();
    let pool = WorkerPool::new(queue.clone(), 1);
    let handles = pool.spawn(shutdown.clone());

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let row = queue.get(&job.id).await.unwrap().unwrap();
        if row.status != "pending" {
            assert_eq!(row.status, "failed");
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "job never failed");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    shutdown.cancel();
    for h in handles {
        let _ = h.await;
    }

    let filter = JobListFilter { job_type: None, status: Some("failed".to_string()) };
    let failed = store.list_jobs(&filter).await.unwrap();
    assert!(failed.iter().any(|j| j.id == job.id));
}
