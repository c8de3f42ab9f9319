//! `EventPipeline::live_tail` must resume from a cursor rather than
//! re-emitting the same batch forever, so a client that reconnects with
//! `?since=<timestamp>` only sees events appended after that point.

use futures_util::StreamExt;
use memva::events::EventPipeline;
use memva::storage::Store;

#[tokio::test]
async fn live_tail_only_yields_events_after_the_given_cursor() {
    let store = Store::open_in_memory().await.unwrap();
    let session = store.create_session("/tmp/proj", None, None, None).await.unwrap();
    let pipeline = EventPipeline::new(store.clone());

    let first = pipeline
        .append(&session.id, "claude-sid", "user", "2026-01-01T00:00:00Z", None, false, None, None, "{}", true)
        .await
        .unwrap();

    let mut tail = Box::pin(pipeline.live_tail(session.id.clone(), None, false));
    let initial_batch = tail.next().await.unwrap().unwrap();
    assert_eq!(initial_batch.len(), 1);
    assert_eq!(initial_batch[0].uuid, first.uuid);

    pipeline
        .append(&session.id, "claude-sid", "assistant", "2026-01-01T00:00:05Z", Some(&first.uuid), false, None, None, "{}", true)
        .await
        .unwrap();

    let second_batch = tail.next().await.unwrap().unwrap();
    assert_eq!(second_batch.len(), 1);
    assert_eq!(second_batch[0].event_type, "assistant");
}

#[tokio::test]
async fn live_tail_resumes_from_an_explicit_since_cursor() {
    let store = Store::open_in_memory().await.unwrap();
    let session = store.create_session("/tmp/proj", None, None, None).await.unwrap();
    let pipeline = EventPipeline::new(store.clone());

    pipeline
        .append(&session.id, "claude-sid", "user", "2026-01-01T00:00:00Z", None, false, None, None, "{}", true)
        .await
        .unwrap();
    let second = pipeline
        .append(&session.id, "claude-sid", "assistant", "2026-01-01T00:00:05Z", None, false, None, None, "{}", true)
        .await
        .unwrap();

    // A reconnecting client passes the timestamp of the last event it saw.
    let mut tail = Box::pin(pipeline.live_tail(session.id.clone(), Some("2026-01-01T00:00:00Z".to_string()), false));
    let batch = tail.next().await.unwrap().unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].uuid, second.uuid);
}
