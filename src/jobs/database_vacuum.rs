//! The `database-vacuum` job — reclaims disk space after sessions/events
//! accumulate and get pruned.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Duration;
use tracing::info;

use crate::queue::JobQueue;
use crate::storage::{JobRow, Store};
use crate::worker::JobHandler;

pub const JOB_TYPE: &str = "database-vacuum";
pub const PRIORITY: i64 = 1;

pub struct DatabaseVacuumHandler {
    store: Store,
    queue: JobQueue,
    prune_archived_after_days: u32,
    interval: Duration,
}

impl DatabaseVacuumHandler {
    pub fn new(store: Store, queue: JobQueue, prune_archived_after_days: u32, interval: Duration) -> Self {
        Self {
            store,
            queue,
            prune_archived_after_days,
            interval,
        }
    }
}

#[async_trait]
impl JobHandler for DatabaseVacuumHandler {
    async fn handle(&self, _job: &JobRow) -> Result<Option<String>> {
        let pruned = self
            .store
            .prune_old_sessions(self.prune_archived_after_days)
            .await?;
        self.store.vacuum().await?;
        info!(pruned, "database vacuum complete");

        self.queue
            .enqueue_at(JOB_TYPE, "{}", PRIORITY, 1, chrono::Utc::now() + self.interval)
            .await?;

        Ok(Some(format!("pruned {pruned} archived sessions, vacuumed")))
    }
}
