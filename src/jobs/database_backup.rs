//! The `database-backup` job — writes a consistent snapshot of the SQLite
//! database to a timestamped file under the backup directory.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Duration;
use tracing::info;

use crate::queue::JobQueue;
use crate::storage::{JobRow, Store};
use crate::worker::JobHandler;

pub const JOB_TYPE: &str = "database-backup";
pub const PRIORITY: i64 = 2;

pub struct DatabaseBackupHandler {
    store: Store,
    queue: JobQueue,
    backup_dir: std::path::PathBuf,
    interval: Duration,
}

impl DatabaseBackupHandler {
    pub fn new(store: Store, queue: JobQueue, backup_dir: std::path::PathBuf, interval: Duration) -> Self {
        Self {
            store,
            queue,
            backup_dir,
            interval,
        }
    }
}

#[async_trait]
impl JobHandler for DatabaseBackupHandler {
    async fn handle(&self, _job: &JobRow) -> Result<Option<String>> {
        tokio::fs::create_dir_all(&self.backup_dir).await?;
        let dest = self
            .backup_dir
            .join(format!("memva-{}.db", chrono::Utc::now().format("%Y%m%dT%H%M%SZ")));
        self.store.backup_to(&dest).await?;
        info!(dest = %dest.display(), "database backup complete");

        self.queue
            .enqueue_at(JOB_TYPE, "{}", PRIORITY, 1, chrono::Utc::now() + self.interval)
            .await?;

        Ok(Some(dest.display().to_string()))
    }
}
