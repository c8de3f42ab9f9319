//! The permission broker communicates with the MCP sidecar exclusively
//! through the Store: `request_and_await` blocks until another task calls
//! `decide`, and a fresh user message supersedes whatever was pending.

use memva::permission::{Decision, PermissionBroker};
use memva::storage::{NewJob, Store};

#[tokio::test]
async fn decide_unblocks_a_waiting_request() {
    let store = Store::open_in_memory().await.unwrap();
    let session = store.create_session("/tmp/proj", None, None, None).await.unwrap();

    // permission_is_answerable requires an active session-runner job.
    store
        .enqueue_job(NewJob {
            job_type: "session-runner",
            data: "{}",
            priority: 0,
            max_attempts: 1,
            scheduled_at: None,
        })
        .await
        .unwrap();

    let broker = PermissionBroker::new(store.clone());
    let broker_clone = broker.clone();
    let session_id = session.id.clone();

    let waiter = tokio::spawn(async move {
        broker_clone
            .request_and_await(&session_id, "bash", "tu_1", "{}")
            .await
            .unwrap()
    });

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let pending = store
        .list_permission_requests(Some(&session.id), Some("pending"))
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);

    broker.decide(&pending[0].id, "allow").await.unwrap();

    let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
        .await
        .expect("waiter timed out")
        .unwrap();
    assert_eq!(outcome, Decision::Allow);
}

#[tokio::test]
async fn new_user_message_supersedes_pending_permission() {
    let store = Store::open_in_memory().await.unwrap();
    let session = store.create_session("/tmp/proj", None, None, None).await.unwrap();
    store
        .enqueue_job(NewJob {
            job_type: "session-runner",
            data: "{}",
            priority: 0,
            max_attempts: 1,
            scheduled_at: None,
        })
        .await
        .unwrap();

    let broker = PermissionBroker::new(store.clone());
    let broker_clone = broker.clone();
    let session_id = session.id.clone();

    let waiter = tokio::spawn(async move {
        broker_clone
            .request_and_await(&session_id, "bash", "tu_1", "{}")
            .await
            .unwrap()
    });

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    broker.expire_after_user_message(&session.id).await.unwrap();

    let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
        .await
        .expect("waiter timed out")
        .unwrap();
    assert_eq!(outcome, Decision::Deny);
}
