pub mod agent;
pub mod config;
pub mod error;
pub mod events;
pub mod jobs;
pub mod mcp;
pub mod permission;
pub mod queue;
pub mod rest;
pub mod session;
pub mod storage;
pub mod worker;

use std::sync::Arc;

use config::MemvaConfig;
use events::EventPipeline;
use permission::PermissionBroker;
use queue::JobQueue;
use storage::Store;

/// Shared application state passed to every REST handler and background
/// task: the Store, the job queue, the permission broker, and the event
/// pipeline, plus the abort registry turns check for cancellation.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<MemvaConfig>,
    pub store: Store,
    pub queue: JobQueue,
    pub permissions: PermissionBroker,
    pub events: EventPipeline,
    pub abort_registry: agent::AbortRegistry,
    pub started_at: std::time::Instant,
}

impl AppContext {
    pub fn new(config: MemvaConfig, store: Store) -> Self {
        let queue = JobQueue::new(store.clone());
        let permissions = PermissionBroker::new(store.clone());
        let events = EventPipeline::new(store.clone());
        Self {
            config: Arc::new(config),
            store,
            queue,
            permissions,
            events,
            abort_registry: agent::new_abort_registry(),
            started_at: std::time::Instant::now(),
        }
    }
}
