//! Fixed-concurrency worker pool driving the durable job queue.
//!
//! A fixed number of tokio tasks poll a shared queue and dispatch to a
//! registry of named [`JobHandler`]s keyed by `jobs.type`.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::queue::JobQueue;
use crate::storage::JobRow;

/// One job type's handling logic. Implementations own whatever state they
/// need (a `Store` handle, an `AgentStreamer`, ...) and are registered once
/// at startup.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Process a claimed job. `Ok(result)` marks it completed with that
    /// optional result payload; `Err` marks it failed (and, if attempts
    /// remain, reschedules it with backoff).
    async fn handle(&self, job: &JobRow) -> Result<Option<String>>;
}

pub struct WorkerPool {
    queue: JobQueue,
    handlers: Arc<HashMap<String, Arc<dyn JobHandler>>>,
    concurrency: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(queue: JobQueue, concurrency: usize) -> Self {
        Self {
            queue,
            handlers: Arc::new(HashMap::new()),
            concurrency: concurrency.max(1),
            poll_interval: Duration::from_millis(250),
        }
    }

    pub fn register(mut self, job_type: &str, handler: Arc<dyn JobHandler>) -> Self {
        Arc::get_mut(&mut self.handlers)
            .expect("register() must run before spawn()")
            .insert(job_type.to_string(), handler);
        self
    }

    /// Spawn `concurrency` worker loops. Returns their join handles so the
    /// caller can await a clean shutdown.
    pub fn spawn(self, shutdown: tokio_util::sync::CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.concurrency)
            .map(|idx| {
                let queue = self.queue.clone();
                let handlers = self.handlers.clone();
                let poll_interval = self.poll_interval;
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    worker_loop(idx, queue, handlers, poll_interval, shutdown).await;
                })
            })
            .collect()
    }
}

async fn worker_loop(
    idx: usize,
    queue: JobQueue,
    handlers: Arc<HashMap<String, Arc<dyn JobHandler>>>,
    poll_interval: Duration,
    shutdown: tokio_util::sync::CancellationToken,
) {
    info!(worker = idx, "worker started");
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        match queue.claim_next().await {
            Ok(Some(job)) => {
                let job_id = job.id.clone();
                let job_type = job.job_type.clone();
                let Some(handler) = handlers.get(&job_type).cloned() else {
                    warn!(worker = idx, job = %job_id, %job_type, "no handler registered for job type");
                    let _ = queue.fail(&job_id, "no handler registered").await;
                    continue;
                };
                match handler.handle(&job).await {
                    Ok(result) => {
                        if let Err(e) = queue.complete(&job_id, result.as_deref()).await {
                            error!(worker = idx, job = %job_id, err = %e, "failed to mark job completed");
                        }
                    }
                    Err(e) => {
                        warn!(worker = idx, job = %job_id, err = %e, "job handler failed");
                        if let Err(e2) = queue.fail(&job_id, &e.to_string()).await {
                            error!(worker = idx, job = %job_id, err = %e2, "failed to mark job failed");
                        }
                    }
                }
            }
            Ok(None) => tokio::time::sleep(poll_interval).await,
            Err(e) => {
                error!(worker = idx, err = %e, "claim_next failed, backing off");
                tokio::time::sleep(poll_interval * 4).await;
            }
        }
    }
    info!(worker = idx, "worker stopped");
}
