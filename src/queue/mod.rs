//! Durable, priority-ordered job queue.
//!
//! Unlike the in-memory `BinaryHeap` a request scheduler can get away with,
//! job state here must survive a daemon restart, so the "queue" is really a
//! thin service wrapper over `Store`'s `jobs` table — `claim_next_due` does
//! the ordering work SQL-side (`ORDER BY priority DESC, created_at ASC`).

pub mod backoff;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::storage::{JobListFilter, JobRow, NewJob, Store};
use backoff::Backoff;

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub by_status_and_type: Vec<(String, String, i64)>,
}

/// Handle to the durable queue. Cheap to clone (wraps `Store`, itself a
/// cloneable pool handle).
#[derive(Clone)]
pub struct JobQueue {
    store: Store,
    backoff: Backoff,
}

impl JobQueue {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            backoff: Backoff::default(),
        }
    }

    pub async fn enqueue(
        &self,
        job_type: &str,
        data: &str,
        priority: i64,
        max_attempts: i64,
    ) -> Result<JobRow> {
        self.store
            .enqueue_job(NewJob {
                job_type,
                data,
                priority,
                max_attempts,
                scheduled_at: None,
            })
            .await
    }

    pub async fn enqueue_at(
        &self,
        job_type: &str,
        data: &str,
        priority: i64,
        max_attempts: i64,
        scheduled_at: DateTime<Utc>,
    ) -> Result<JobRow> {
        self.store
            .enqueue_job(NewJob {
                job_type,
                data,
                priority,
                max_attempts,
                scheduled_at: Some(scheduled_at),
            })
            .await
    }

    /// Claim the next due job, if any. Safe to call concurrently from
    /// multiple worker loops — the underlying `UPDATE ... WHERE status =
    /// 'pending'` guard makes exactly one caller win per job.
    pub async fn claim_next(&self) -> Result<Option<JobRow>> {
        self.store.claim_next_due(Utc::now()).await
    }

    pub async fn complete(&self, id: &str, result: Option<&str>) -> Result<()> {
        self.store.complete_job(id, result).await
    }

    pub async fn fail(&self, id: &str, error: &str) -> Result<()> {
        self.store.fail_job(id, error, &self.backoff).await
    }

    pub async fn cancel(&self, id: &str) -> Result<()> {
        self.store.cancel_job(id).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<JobRow>> {
        self.store.get_job(id).await
    }

    pub async fn list(&self, filter: &JobListFilter) -> Result<Vec<JobRow>> {
        self.store.list_jobs(filter).await
    }

    pub async fn active_session_runner_job(&self, session_id: &str) -> Result<Option<JobRow>> {
        self.store.active_session_runner_job(session_id).await
    }

    pub async fn active_job_of_type(&self, job_type: &str) -> Result<Option<JobRow>> {
        self.store.active_job_of_type(job_type).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            by_status_and_type: self.store.job_stats().await?,
        })
    }
}
