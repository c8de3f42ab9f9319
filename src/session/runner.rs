//! The `session-runner` job handler.
//!
//! One job of type `session-runner` represents one queued turn: "run the
//! agent for this session against this user message." Claiming, invoking,
//! and completing/failing the job is handled by the generic [`WorkerPool`](
//! crate::worker::WorkerPool); this module only supplies the per-job-type
//! logic via [`JobHandler`] — a one-shot handler invoked per claimed job,
//! rather than a persistent in-memory runner map, since the durable queue
//! is what survives a restart here.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::agent::{AgentStreamer, TurnOutcome};
use crate::permission::PermissionBroker;
use crate::storage::{JobRow, Store};
use crate::worker::JobHandler;

#[derive(Debug, Deserialize)]
pub struct SessionRunnerPayload {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub content: String,
}

pub struct SessionRunnerHandler {
    store: Store,
    streamer: AgentStreamer,
    permissions: PermissionBroker,
}

impl SessionRunnerHandler {
    pub fn new(store: Store, streamer: AgentStreamer, permissions: PermissionBroker) -> Self {
        Self {
            store,
            streamer,
            permissions,
        }
    }
}

#[async_trait]
impl JobHandler for SessionRunnerHandler {
    async fn handle(&self, job: &JobRow) -> Result<Option<String>> {
        let payload: SessionRunnerPayload =
            serde_json::from_str(&job.data).context("invalid session-runner job payload")?;

        let session = self
            .store
            .get_session(&payload.session_id)
            .await?
            .with_context(|| format!("session {} not found", payload.session_id))?;

        // A fresh turn supersedes anything the user was still being asked
        // about from a previous, now-stale turn.
        self.permissions
            .expire_after_user_message(&session.id)
            .await?;

        let settings = self.store.effective_settings(&session.id).await?;

        let now = chrono::Utc::now().to_rfc3339();
        self.store
            .append_event(
                &session.id,
                "",
                "user",
                &now,
                self.store.latest_event(&session.id).await?.map(|e| e.uuid).as_deref(),
                false,
                Some(&session.project_path),
                None,
                &serde_json::json!({
                    "type": "user",
                    "message": { "role": "user", "content": [{ "type": "text", "text": payload.content }] }
                })
                .to_string(),
                true,
            )
            .await?;

        let outcome = self
            .streamer
            .run_turn(&session, &payload.content, &settings)
            .await?;
        info!(session = %session.id, job = %job.id, ?outcome, "turn finished");

        map_turn_outcome(outcome)
    }
}

/// A timed-out turn must fail the job — `queue.fail` reschedules it with
/// backoff (or marks it permanently failed once attempts are exhausted)
/// rather than `queue.complete` silently treating it as a success.
fn map_turn_outcome(outcome: TurnOutcome) -> Result<Option<String>> {
    match outcome {
        TurnOutcome::Completed => Ok(Some("completed".to_string())),
        TurnOutcome::Aborted => Ok(Some("aborted".to_string())),
        TurnOutcome::TimedOut => anyhow::bail!("agent turn timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_and_aborted_turns_succeed_the_job() {
        assert_eq!(map_turn_outcome(TurnOutcome::Completed).unwrap(), Some("completed".to_string()));
        assert_eq!(map_turn_outcome(TurnOutcome::Aborted).unwrap(), Some("aborted".to_string()));
    }

    #[test]
    fn timed_out_turn_fails_the_job_with_a_descriptive_error() {
        let err = map_turn_outcome(TurnOutcome::TimedOut).unwrap_err();
        assert!(err.to_string().contains("timed out"), "error was: {err}");
    }
}
