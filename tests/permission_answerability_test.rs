//! The `/decide` REST handler now gates on `Store::permission_is_answerable`
//! instead of trusting a merely-`pending` status row — a request can stop
//! being answerable without ever changing status (its job disappeared, or a
//! newer user message superseded it).

use memva::storage::{NewJob, Store};

#[tokio::test]
async fn request_with_no_active_job_is_not_answerable() {
    let store = Store::open_in_memory().await.unwrap();
    let session = store.create_session("/tmp/proj", None, None, None).await.unwrap();

    let request = store
        .create_permission_request(&session.id, "bash", "tu_1", "{}")
        .await
        .unwrap();

    // No session-runner job was ever enqueued for this session.
    assert!(!store.permission_is_answerable(&request).await.unwrap());
}

#[tokio::test]
async fn request_with_an_active_job_and_no_newer_message_is_answerable() {
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

    let request = store
        .create_permission_request(&session.id, "bash", "tu_1", "{}")
        .await
        .unwrap();

    assert!(store.permission_is_answerable(&request).await.unwrap());
}

#[tokio::test]
async fn request_superseded_by_a_newer_user_message_is_not_answerable() {
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

    let request = store
        .create_permission_request(&session.id, "bash", "tu_1", "{}")
        .await
        .unwrap();
    assert!(store.permission_is_answerable(&request).await.unwrap());

    // A fresh user message arrives after the permission request was created —
    // the agent has moved on and this request no longer reflects what the
    // user is actually being asked about.
    store
        .append_event(
            &session.id,
            "",
            "user",
            &chrono::Utc::now().to_rfc3339(),
            None,
            false,
            Some(&session.project_path),
            None,
            "{}",
            true,
        )
        .await
        .unwrap();

    assert!(!store.permission_is_answerable(&request).await.unwrap());
}
