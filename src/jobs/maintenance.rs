//! The `maintenance` job — recovers jobs stuck `running` past a grace
//! period and expires overdue permission requests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Duration;
use tracing::info;

use crate::queue::JobQueue;
use crate::storage::{JobRow, Store};
use crate::worker::JobHandler;

pub const JOB_TYPE: &str = "maintenance";
pub const PRIORITY: i64 = 3;

pub struct MaintenanceHandler {
    store: Store,
    queue: JobQueue,
    grace: Duration,
    interval: Duration,
}

impl MaintenanceHandler {
    pub fn new(store: Store, queue: JobQueue, grace: Duration, interval: Duration) -> Self {
        Self {
            store,
            queue,
            grace,
            interval,
        }
    }
}

#[async_trait]
impl JobHandler for MaintenanceHandler {
    async fn handle(&self, _job: &JobRow) -> Result<Option<String>> {
        let stale = self.store.recover_stale_jobs(self.grace).await?;
        let expired = self.store.expire_overdue_permissions().await?;
        if stale > 0 || expired > 0 {
            info!(stale, expired, "maintenance pass complete");
        }

        self.queue
            .enqueue_at(JOB_TYPE, "{}", PRIORITY, 1, chrono::Utc::now() + self.interval)
            .await?;

        Ok(Some(format!("recovered {stale} jobs, expired {expired} permissions")))
    }
}
