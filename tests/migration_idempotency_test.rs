//! `Store::open` re-runs the schema migration on every startup (no separate
//! "has this run before" bookkeeping) — it must be safe to open the same
//! on-disk database twice without error, and prior data must survive.

use memva::storage::Store;
use tempfile::TempDir;

#[tokio::test]
async fn reopening_the_same_database_is_idempotent_and_preserves_data() {
    let dir = TempDir::new().unwrap();

    let session_id = {
        let store = Store::open(dir.path(), "test").await.unwrap();
        let session = store.create_session("/tmp/proj", Some("first run"), None, None).await.unwrap();
        session.id
    };

    // Simulates a daemon restart: same data_dir, same env, fresh pool.
    let store = Store::open(dir.path(), "test").await.unwrap();
    let session = store.get_session(&session_id).await.unwrap();
    assert!(session.is_some(), "session created before restart should survive");
    assert_eq!(session.unwrap().title.as_deref(), Some("first run"));

    // A third open, just to confirm migration re-application keeps being a no-op.
    let store3 = Store::open(dir.path(), "test").await.unwrap();
    assert!(store3.get_session(&session_id).await.unwrap().is_some());
}
