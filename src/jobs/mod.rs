//! Periodic upkeep job types: `maintenance`, `session-sync`,
//! `database-vacuum`, `database-backup`.
//!
//! Each is a self-rescheduling [`JobHandler`](crate::worker::JobHandler):
//! rather than an ad-hoc `tokio::time::interval` loop running independent of
//! the durable queue, every run enqueues its own successor with
//! `scheduled_at` pushed out by its interval — so the schedule survives a
//! daemon restart the same way any other job does, and shows up in the same
//! job-stats/listing endpoints as `session-runner` work.

pub mod database_backup;
pub mod database_vacuum;
pub mod maintenance;
pub mod session_sync;
