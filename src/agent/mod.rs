//! Agent streamer — spawns the coding-agent subprocess for one turn, parses
//! its `stream-json` stdout into the event log, and captures the agent's own
//! session id for `--resume` on the next turn.
//!
//! Built around the usual subprocess run-loop shape (spawn, pipe stdout,
//! parse one JSON object per line), plus three things a single-process
//! runner wouldn't need: out-of-process permission brokering via an MCP
//! sidecar, deferred abort, and a resume-failure fallback.

pub mod protocol;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use serde_json::json;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::Mutex,
};
use tracing::{debug, warn};

use crate::storage::{EffectiveSettings, SessionRow, Store};
use protocol::{parse_line, AgentLine};

/// Tool name the MCP permission sidecar registers under `mcpServers`; the
/// agent is told to route every permission check to it.
const PERMISSION_TOOL_NAME: &str = "mcp__memva_permission__request";

/// Deferred-abort flags for one in-flight turn.
///
/// Aborting mid-turn before the agent has produced any visible output would
/// leave the user staring at nothing; `requested` is latched immediately but
/// only takes effect (via `accepted`) once the first assistant message has
/// streamed in.
#[derive(Default)]
pub struct AbortFlags {
    requested: AtomicBool,
    accepted: AtomicBool,
}

impl AbortFlags {
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted.load(Ordering::SeqCst)
    }

    fn accept(&self) {
        self.accepted.store(true, Ordering::SeqCst);
    }
}

/// In-memory registry of the abort flags for every currently running turn,
/// keyed by memva session id. Shared on `AppContext` so REST handlers can
/// request an abort without reaching into the worker pool.
pub type AbortRegistry = Arc<Mutex<HashMap<String, Arc<AbortFlags>>>>;

pub fn new_abort_registry() -> AbortRegistry {
    Arc::new(Mutex::new(HashMap::new()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Aborted,
    TimedOut,
}

pub struct AgentStreamer {
    store: Store,
    abort_registry: AbortRegistry,
    agent_timeout_secs: u64,
    mcp_sidecar_path: std::path::PathBuf,
    data_dir: std::path::PathBuf,
    env_name: String,
}

impl AgentStreamer {
    pub fn new(
        store: Store,
        abort_registry: AbortRegistry,
        agent_timeout_secs: u64,
        mcp_sidecar_path: std::path::PathBuf,
        data_dir: std::path::PathBuf,
        env_name: String,
    ) -> Self {
        Self {
            store,
            abort_registry,
            agent_timeout_secs,
            mcp_sidecar_path,
            data_dir,
            env_name,
        }
    }

    /// Run one turn of the agent for `session`, sending `user_content` under
    /// `settings` (the session's effective `maxTurns`/`permissionMode`).
    /// Resumes the agent's own session if one was previously captured.
    pub async fn run_turn(
        &self,
        session: &SessionRow,
        user_content: &str,
        settings: &EffectiveSettings,
    ) -> Result<TurnOutcome> {
        let flags = Arc::new(AbortFlags::default());
        self.abort_registry
            .lock()
            .await
            .insert(session.id.clone(), flags.clone());

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(self.agent_timeout_secs),
            self.run_turn_inner(session, user_content, settings, &flags),
        )
        .await;

        self.abort_registry.lock().await.remove(&session.id);

        match result {
            Ok(inner) => inner,
            Err(_) => {
                self.store
                    .update_claude_status(&session.id, "error")
                    .await?;
                Ok(TurnOutcome::TimedOut)
            }
        }
    }

    async fn run_turn_inner(
        &self,
        session: &SessionRow,
        user_content: &str,
        settings: &EffectiveSettings,
        flags: &Arc<AbortFlags>,
    ) -> Result<TurnOutcome> {
        let resume_sid = self.store.latest_claude_session_id(&session.id).await?;

        let outcome = self
            .spawn_and_stream(session, user_content, settings, resume_sid.as_deref(), flags)
            .await?;

        // Resume-failure fallback: if the resume attempt produced no events
        // at all before exiting, the agent's session file was likely lost —
        // retry once from scratch rather than surfacing a hard error.
        if let SpawnResult::NoEventsEmitted = outcome {
            if resume_sid.is_some() {
                warn!(session = %session.id, "resume produced no events, retrying without --resume");
                return match self
                    .spawn_and_stream(session, user_content, settings, None, flags)
                    .await?
                {
                    SpawnResult::Completed(o) => Ok(o),
                    SpawnResult::NoEventsEmitted => {
                        self.store.update_claude_status(&session.id, "error").await?;
                        anyhow::bail!("agent produced no output even without --resume")
                    }
                };
            }
            self.store.update_claude_status(&session.id, "error").await?;
            anyhow::bail!("agent produced no output");
        }

        match outcome {
            SpawnResult::Completed(o) => Ok(o),
            SpawnResult::NoEventsEmitted => unreachable!(),
        }
    }

    async fn spawn_and_stream(
        &self,
        session: &SessionRow,
        user_content: &str,
        settings: &EffectiveSettings,
        resume_sid: Option<&str>,
        flags: &Arc<AbortFlags>,
    ) -> Result<SpawnResult> {
        // Unless the session has opted out of permission checks entirely,
        // wire the MCP sidecar in and restrict the agent to an allowlist of
        // `Read` plus the permission tool — everything else routes through
        // the broker instead of being auto-approved.
        let bypass = settings.permission_mode == "bypassPermissions";
        let mcp_config_path = if bypass {
            None
        } else {
            Some(self.write_mcp_config(session).await?)
        };

        let mut cmd = Command::new("claude");
        cmd.args([
            "--output-format",
            "stream-json",
            "--max-turns",
            &settings.max_turns.to_string(),
            "--permission-mode",
            &settings.permission_mode,
        ]);
        if let Some(path) = &mcp_config_path {
            cmd.args([
                "--permission-prompt-tool",
                PERMISSION_TOOL_NAME,
                "--mcp-config",
                path.to_string_lossy().as_ref(),
                "--allowedTools",
                &format!("Read,{PERMISSION_TOOL_NAME}"),
            ]);
        }
        cmd.args(["-p", user_content]);
        if let Some(sid) = resume_sid {
            cmd.args(["--resume", sid]);
        }

        let mut child = cmd
            .current_dir(&session.project_path)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .stdin(std::process::Stdio::null())
            .spawn()
            .context("failed to spawn agent — is `claude` installed and on PATH?")?;

        let stdout = child.stdout.take().context("no stdout")?;
        let stderr = child.stderr.take().context("no stderr")?;

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "agent_stderr", "{}", line);
            }
        });

        self.store.update_claude_status(&session.id, "processing").await?;

        let mut lines = BufReader::new(stdout).lines();
        let mut parent_uuid = self
            .store
            .latest_event(&session.id)
            .await?
            .map(|e| e.uuid);
        let mut events_emitted = 0u64;
        let mut received_assistant = false;
        let mut aborted = false;

        while let Some(line) = lines.next_line().await? {
            let Some((parsed, raw)) = parse_line(&line) else {
                warn!(line = %line, "unparseable agent event");
                continue;
            };

            // Deferred abort is latched the moment an abort is requested but
            // only takes effect on the first assistant message; when that
            // message is the one satisfying it, it must be discarded rather
            // than stored — only the preceding `system` event survives.
            let is_first_assistant = matches!(parsed, AgentLine::Assistant { .. }) && !received_assistant;
            if should_discard_for_abort(flags.is_requested(), is_first_assistant, flags.is_accepted()) {
                flags.accept();
                let _ = child.kill().await;
                aborted = true;
                break;
            }

            let (event_type, agent_session_id, visible) = match &parsed {
                AgentLine::System { session_id, .. } => ("system", session_id.clone(), false),
                AgentLine::Assistant { session_id, .. } => {
                    received_assistant = true;
                    ("assistant", session_id.clone(), true)
                }
                AgentLine::User { session_id, .. } => ("user", session_id.clone(), true),
                AgentLine::Result { session_id, .. } => ("result", session_id.clone(), false),
                AgentLine::Unknown => ("unknown", None, false),
            };

            let event = self
                .store
                .append_event(
                    &session.id,
                    agent_session_id.as_deref().unwrap_or(""),
                    event_type,
                    &chrono::Utc::now().to_rfc3339(),
                    parent_uuid.as_deref(),
                    false,
                    Some(&session.project_path),
                    None,
                    &raw.to_string(),
                    visible,
                )
                .await?;
            parent_uuid = Some(event.uuid);
            events_emitted += 1;

            // Abort requested after at least one assistant message has
            // already streamed and been stored: the in-flight line just
            // appended stays stored, then the turn aborts.
            if flags.is_requested() && received_assistant && !flags.is_accepted() {
                flags.accept();
                let _ = child.kill().await;
                aborted = true;
                break;
            }
        }

        if let Err(e) = child.wait().await {
            warn!(session = %session.id, err = %e, "agent process wait failed");
        }
        if let Some(path) = &mcp_config_path {
            let _ = tokio::fs::remove_file(path).await;
        }

        // Both user abort and normal completion land the session on
        // `completed` — only a timeout or unhandled error produces `error`.
        if aborted {
            self.store.update_claude_status(&session.id, "completed").await?;
            return Ok(SpawnResult::Completed(TurnOutcome::Aborted));
        }
        if events_emitted == 0 {
            return Ok(SpawnResult::NoEventsEmitted);
        }
        self.store.update_claude_status(&session.id, "completed").await?;
        Ok(SpawnResult::Completed(TurnOutcome::Completed))
    }

    /// Write a temporary MCP server config pointing at the permission
    /// sidecar binary, scoped to this session via environment variables.
    async fn write_mcp_config(&self, session: &SessionRow) -> Result<std::path::PathBuf> {
        let config = json!({
            "mcpServers": {
                "memva_permission": {
                    "command": self.mcp_sidecar_path.to_string_lossy(),
                    "env": {
                        "MEMVA_DATA_DIR": self.data_dir.to_string_lossy(),
                        "MEMVA_ENV": self.env_name,
                        "MEMVA_SESSION_ID": session.id,
                    }
                }
            }
        });
        let path = self.data_dir.join(format!("mcp-{}.json", session.id));
        tokio::fs::write(&path, serde_json::to_vec_pretty(&config)?).await?;
        Ok(path)
    }
}

enum SpawnResult {
    Completed(TurnOutcome),
    NoEventsEmitted,
}

/// Whether the event currently being processed — the first assistant message
/// of the turn — must be dropped rather than appended because an abort was
/// requested before it streamed in.
fn should_discard_for_abort(requested: bool, is_first_assistant: bool, already_accepted: bool) -> bool {
    requested && is_first_assistant && !already_accepted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_flags_latch_request_and_accept_independently() {
        let flags = AbortFlags::default();
        assert!(!flags.is_requested());
        assert!(!flags.is_accepted());

        flags.request();
        assert!(flags.is_requested());
        assert!(!flags.is_accepted());

        flags.accept();
        assert!(flags.is_accepted());
    }

    #[test]
    fn first_assistant_message_is_discarded_when_abort_precedes_it() {
        // Abort requested, first assistant message arriving, not yet accepted:
        // this is the message that must be dropped.
        assert!(should_discard_for_abort(true, true, false));
    }

    #[test]
    fn no_discard_without_a_pending_abort_request() {
        assert!(!should_discard_for_abort(false, true, false));
    }

    #[test]
    fn no_discard_for_non_first_assistant_messages() {
        // Abort requested but this isn't the first assistant message — the
        // in-flight line stores normally and the turn aborts after.
        assert!(!should_discard_for_abort(true, false, false));
    }

    #[test]
    fn no_double_discard_once_already_accepted() {
        assert!(!should_discard_for_abort(true, true, true));
    }
}
