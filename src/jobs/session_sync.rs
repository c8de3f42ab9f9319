//! The `session-sync` job — repairs sessions left `processing` or
//! `waiting_for_input` with no active `session-runner` job backing them, the
//! same inconsistency startup recovery fixes after a crash, caught mid-run.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Duration;
use tracing::info;

use crate::queue::JobQueue;
use crate::storage::{JobRow, Store};
use crate::worker::JobHandler;

pub const JOB_TYPE: &str = "session-sync";
pub const PRIORITY: i64 = 5;

pub struct SessionSyncHandler {
    store: Store,
    queue: JobQueue,
    interval: Duration,
}

impl SessionSyncHandler {
    pub fn new(store: Store, queue: JobQueue, interval: Duration) -> Self {
        Self { store, queue, interval }
    }
}

#[async_trait]
impl JobHandler for SessionSyncHandler {
    async fn handle(&self, _job: &JobRow) -> Result<Option<String>> {
        let fixed = self.store.sync_orphaned_sessions().await?;
        if fixed > 0 {
            info!(fixed, "session-sync repaired orphaned sessions");
        }

        self.queue
            .enqueue_at(JOB_TYPE, "{}", PRIORITY, 1, chrono::Utc::now() + self.interval)
            .await?;

        Ok(Some(format!("repaired {fixed} sessions")))
    }
}
