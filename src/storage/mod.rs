//! The Store — single owner of all persisted state (sessions, events, jobs,
//! permission requests, settings).
//!
//! Every mutation goes through one `SqlitePool` in WAL mode. Readers run
//! concurrently; SQLite's single-writer model plus the guarded `UPDATE`
//! idioms below (`claim_next_due`, `decide_permission`) give us the atomic
//! claim/transition primitives the rest of the system relies on without a
//! separate application-level lock.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::{sqlite::SqliteConnectOptions, Row, SqlitePool};
use std::{path::Path, str::FromStr};
use uuid::Uuid;

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from blocking the daemon indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Execute a future with the standard query timeout.
/// Returns an error if the operation takes longer than `QUERY_TIMEOUT`.
async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

// ─── Rows ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct SessionRow {
    pub id: String,
    pub title: Option<String>,
    pub project_path: String,
    pub status: String,
    pub claude_status: String,
    pub settings: Option<String>,
    pub metadata: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct EventRow {
    pub uuid: String,
    pub memva_session_id: String,
    pub session_id: String,
    pub event_type: String,
    pub timestamp: String,
    pub parent_uuid: Option<String>,
    pub is_sidechain: bool,
    pub cwd: Option<String>,
    pub project_name: Option<String>,
    pub data: String,
    pub visible: bool,
    pub synced_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct JobRow {
    pub id: String,
    #[sqlx(rename = "type")]
    pub job_type: String,
    pub data: String,
    pub status: String,
    pub priority: i64,
    pub attempts: i64,
    pub max_attempts: i64,
    pub error: Option<String>,
    pub result: Option<String>,
    pub scheduled_at: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct PermissionRequestRow {
    pub id: String,
    pub session_id: String,
    pub tool_name: String,
    pub tool_use_id: String,
    pub input: String,
    pub status: String,
    pub decision: Option<String>,
    pub decided_at: Option<String>,
    pub created_at: String,
    pub expires_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct SettingsRow {
    pub id: i64,
    pub max_turns: i64,
    pub permission_mode: String,
    pub default_directory: Option<String>,
    pub updated_at: String,
}

/// A session's partial override of the global settings, stored as the raw
/// JSON blob in `sessions.settings`. Any field left absent falls back to the
/// global row.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct SessionSettingsOverride {
    pub max_turns: Option<i64>,
    pub permission_mode: Option<String>,
    pub default_directory: Option<String>,
}

/// The settings actually in force for one session: its override layered
/// over the global singleton row.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EffectiveSettings {
    pub max_turns: i64,
    pub permission_mode: String,
    pub default_directory: Option<String>,
}

/// Parameters for `enqueue_job`.
pub struct NewJob<'a> {
    pub job_type: &'a str,
    pub data: &'a str,
    pub priority: i64,
    pub max_attempts: i64,
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct JobListFilter {
    pub job_type: Option<String>,
    pub status: Option<String>,
}

// ─── Store ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the SQLite file for `env` under `data_dir`.
    pub async fn open(data_dir: &Path, env: &str) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join(format!("memva-{env}.db"));
        let opts = SqliteConnectOptions::from_str(&format!(
            "sqlite://{}?mode=rwc",
            db_path.display()
        ))?
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .foreign_keys(true)
        .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory store for tests — single connection, never shared across files.
    #[cfg(any(test, feature = "test-support"))]
    pub async fn open_in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?
            .foreign_keys(true)
            .create_if_missing(true);
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Return a clone of the connection pool (cheap — Arc-backed).
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for sql in [include_str!("migrations/001_init.sql")] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    // ─── Sessions ───────────────────────────────────────────────────────────

    pub async fn create_session(
        &self,
        project_path: &str,
        title: Option<&str>,
        settings: Option<&str>,
        metadata: Option<&str>,
    ) -> Result<SessionRow> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        sqlx::query(
            "INSERT INTO sessions (id, title, project_path, status, claude_status, settings, metadata, created_at, updated_at)
             VALUES (?, ?, ?, 'active', 'not_started', ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(title)
        .bind(project_path)
        .bind(settings)
        .bind(metadata)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        self.get_session(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session not found after insert"))
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<SessionRow>> {
        Ok(sqlx::query_as("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionRow>> {
        with_timeout(async {
            Ok(
                sqlx::query_as("SELECT * FROM sessions ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await?,
            )
        })
        .await
    }

    pub async fn update_claude_status(&self, session_id: &str, status: &str) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query("UPDATE sessions SET claude_status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(&now)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_session_settings(&self, session_id: &str, settings: &str) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query("UPDATE sessions SET settings = ?, updated_at = ? WHERE id = ?")
            .bind(settings)
            .bind(&now)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// This session's raw settings override, if any has been set.
    pub async fn session_settings_override(&self, session_id: &str) -> Result<Option<SessionSettingsOverride>> {
        let session = self
            .get_session(session_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session {session_id} not found"))?;
        session
            .settings
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("stored session settings override is not valid JSON")
    }

    /// Effective settings for a session: its override layered over the
    /// global singleton row, field by field.
    pub async fn effective_settings(&self, session_id: &str) -> Result<EffectiveSettings> {
        let global = self.get_global_settings().await?;
        let over = self.session_settings_override(session_id).await?.unwrap_or_default();
        Ok(EffectiveSettings {
            max_turns: over.max_turns.unwrap_or(global.max_turns),
            permission_mode: over.permission_mode.unwrap_or(global.permission_mode),
            default_directory: over.default_directory.or(global.default_directory),
        })
    }

    pub async fn archive_session(&self, session_id: &str) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query("UPDATE sessions SET status = 'archived', updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Latest non-empty agent `session_id` across this session's events,
    /// used to resume. `None` if the agent has never assigned one.
    pub async fn latest_claude_session_id(&self, memva_session_id: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT session_id FROM events
             WHERE memva_session_id = ? AND session_id != ''
             ORDER BY timestamp DESC, rowid DESC LIMIT 1",
        )
        .bind(memva_session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(s,)| s))
    }

    // ─── Events ─────────────────────────────────────────────────────────────

    /// Append one event. The caller supplies `parent_uuid`; the store does
    /// not recompute linkage.
    #[allow(clippy::too_many_arguments)]
    pub async fn append_event(
        &self,
        memva_session_id: &str,
        session_id: &str,
        event_type: &str,
        timestamp: &str,
        parent_uuid: Option<&str>,
        is_sidechain: bool,
        cwd: Option<&str>,
        project_name: Option<&str>,
        data: &str,
        visible: bool,
    ) -> Result<EventRow> {
        let uuid = Uuid::new_v4().to_string();
        let synced_at = now_rfc3339();
        sqlx::query(
            "INSERT INTO events (uuid, memva_session_id, session_id, event_type, timestamp, parent_uuid, is_sidechain, cwd, project_name, data, visible, synced_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&uuid)
        .bind(memva_session_id)
        .bind(session_id)
        .bind(event_type)
        .bind(timestamp)
        .bind(parent_uuid)
        .bind(is_sidechain)
        .bind(cwd)
        .bind(project_name)
        .bind(data)
        .bind(visible)
        .bind(&synced_at)
        .execute(&self.pool)
        .await?;
        self.get_event(&uuid)
            .await?
            .ok_or_else(|| anyhow::anyhow!("event not found after insert"))
    }

    pub async fn get_event(&self, uuid: &str) -> Result<Option<EventRow>> {
        Ok(sqlx::query_as("SELECT * FROM events WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Most recent event for a session, used to compute `initialParentUuid`.
    pub async fn latest_event(&self, memva_session_id: &str) -> Result<Option<EventRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM events WHERE memva_session_id = ? ORDER BY timestamp DESC, rowid DESC LIMIT 1",
        )
        .bind(memva_session_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Events with `timestamp > since`, newest-first (callers reverse for
    /// chronological display).
    pub async fn events_since(
        &self,
        memva_session_id: &str,
        since: &str,
        include_hidden: bool,
    ) -> Result<Vec<EventRow>> {
        let sql = if include_hidden {
            "SELECT * FROM events WHERE memva_session_id = ? AND timestamp > ? ORDER BY timestamp DESC, rowid DESC"
        } else {
            "SELECT * FROM events WHERE memva_session_id = ? AND timestamp > ? AND visible = 1 ORDER BY timestamp DESC, rowid DESC"
        };
        Ok(sqlx::query_as(sql)
            .bind(memva_session_id)
            .bind(since)
            .fetch_all(&self.pool)
            .await?)
    }

    /// All events for a session, oldest-first.
    pub async fn events_for_session(
        &self,
        memva_session_id: &str,
        include_hidden: bool,
    ) -> Result<Vec<EventRow>> {
        let sql = if include_hidden {
            "SELECT * FROM events WHERE memva_session_id = ? ORDER BY timestamp ASC, rowid ASC"
        } else {
            "SELECT * FROM events WHERE memva_session_id = ? AND visible = 1 ORDER BY timestamp ASC, rowid ASC"
        };
        Ok(sqlx::query_as(sql)
            .bind(memva_session_id)
            .fetch_all(&self.pool)
            .await?)
    }

    /// Latest assistant event per session, one query for the whole batch —
    /// avoids N+1 when rendering a session list.
    pub async fn latest_assistant_message_per_session(
        &self,
        session_ids: &[String],
    ) -> Result<std::collections::HashMap<String, EventRow>> {
        if session_ids.is_empty() {
            return Ok(std::collections::HashMap::new());
        }
        let placeholders = vec!["?"; session_ids.len()].join(",");
        let sql = format!(
            "SELECT * FROM events WHERE event_type = 'assistant' AND memva_session_id IN ({placeholders})
             ORDER BY memva_session_id, timestamp DESC, rowid DESC"
        );
        let mut q = sqlx::query_as::<_, EventRow>(&sql);
        for id in session_ids {
            q = q.bind(id);
        }
        let rows = q.fetch_all(&self.pool).await?;
        let mut out = std::collections::HashMap::new();
        for row in rows {
            out.entry(row.memva_session_id.clone()).or_insert(row);
        }
        Ok(out)
    }

    // ─── Jobs ───────────────────────────────────────────────────────────────

    pub async fn enqueue_job(&self, job: NewJob<'_>) -> Result<JobRow> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let scheduled_at = job.scheduled_at.map(|t| t.to_rfc3339());
        sqlx::query(
            "INSERT INTO jobs (id, type, data, status, priority, attempts, max_attempts, scheduled_at, created_at, updated_at)
             VALUES (?, ?, ?, 'pending', ?, 0, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(job.job_type)
        .bind(job.data)
        .bind(job.priority)
        .bind(job.max_attempts)
        .bind(&scheduled_at)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        self.get_job(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("job not found after insert"))
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<JobRow>> {
        Ok(sqlx::query_as("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Atomically claim the highest-priority due job.
    ///
    /// Jobs whose `attempts` already reached `max_attempts` are marked
    /// `failed` and skipped instead of claimed — this can happen if a prior
    /// crash incremented `attempts` without a matching terminal transition.
    pub async fn claim_next_due(&self, now: DateTime<Utc>) -> Result<Option<JobRow>> {
        let now_s = now.to_rfc3339();
        loop {
            let candidate: Option<JobRow> = sqlx::query_as(
                "SELECT * FROM jobs
                 WHERE status = 'pending' AND (scheduled_at IS NULL OR scheduled_at <= ?)
                 ORDER BY priority DESC, created_at ASC, id ASC LIMIT 1",
            )
            .bind(&now_s)
            .fetch_optional(&self.pool)
            .await?;

            let Some(candidate) = candidate else {
                return Ok(None);
            };

            if candidate.attempts >= candidate.max_attempts {
                sqlx::query(
                    "UPDATE jobs SET status = 'failed', error = 'max attempts exceeded', updated_at = ?
                     WHERE id = ? AND status = 'pending'",
                )
                .bind(&now_s)
                .bind(&candidate.id)
                .execute(&self.pool)
                .await?;
                continue;
            }

            // This eliminates the TOCTOU window between the SELECT above and
            // the claim: only one concurrent caller's UPDATE can match.
            let result = sqlx::query(
                "UPDATE jobs SET status = 'running', started_at = ?, attempts = attempts + 1, updated_at = ?
                 WHERE id = ? AND status = 'pending'",
            )
            .bind(&now_s)
            .bind(&now_s)
            .bind(&candidate.id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                continue;
            }

            return self.get_job(&candidate.id).await;
        }
    }

    pub async fn complete_job(&self, id: &str, result: Option<&str>) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query(
            "UPDATE jobs SET status = 'completed', result = ?, completed_at = ?, updated_at = ?
             WHERE id = ? AND status NOT IN ('completed', 'failed', 'cancelled')",
        )
        .bind(result)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fail a job. If attempts remain, it is rescheduled with backoff;
    /// otherwise marked terminally `failed`.
    pub async fn fail_job(
        &self,
        id: &str,
        error: &str,
        backoff: &crate::queue::backoff::Backoff,
    ) -> Result<()> {
        let now = Utc::now();
        let job = self
            .get_job(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("fail_job: job {id} not found"))?;

        if job.attempts < job.max_attempts {
            let delay = backoff.delay_secs(job.attempts);
            let scheduled_at = (now + Duration::seconds(delay as i64)).to_rfc3339();
            sqlx::query(
                "UPDATE jobs SET status = 'pending', error = ?, scheduled_at = ?, started_at = NULL, updated_at = ?
                 WHERE id = ? AND status NOT IN ('completed', 'failed', 'cancelled')",
            )
            .bind(error)
            .bind(&scheduled_at)
            .bind(now.to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                "UPDATE jobs SET status = 'failed', error = ?, completed_at = ?, updated_at = ?
                 WHERE id = ? AND status NOT IN ('completed', 'failed', 'cancelled')",
            )
            .bind(error)
            .bind(now.to_rfc3339())
            .bind(now.to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn cancel_job(&self, id: &str) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query(
            "UPDATE jobs SET status = 'cancelled', updated_at = ?
             WHERE id = ? AND status NOT IN ('completed', 'failed', 'cancelled')",
        )
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_jobs(&self, filter: &JobListFilter) -> Result<Vec<JobRow>> {
        let mut sql = String::from("SELECT * FROM jobs WHERE 1=1");
        if filter.job_type.is_some() {
            sql.push_str(" AND type = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut q = sqlx::query_as::<_, JobRow>(&sql);
        if let Some(t) = &filter.job_type {
            q = q.bind(t);
        }
        if let Some(s) = &filter.status {
            q = q.bind(s);
        }
        Ok(q.fetch_all(&self.pool).await?)
    }

    /// The active (`pending` or `running`) `session-runner` job for a
    /// session, if any.
    pub async fn active_session_runner_job(&self, session_id: &str) -> Result<Option<JobRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM jobs
             WHERE type = 'session-runner' AND status IN ('pending', 'running')
             AND json_extract(data, '$.sessionId') = ?
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// The active (`pending` or `running`) job of a given type, if any —
    /// used to avoid double-bootstrapping a periodic maintenance job.
    pub async fn active_job_of_type(&self, job_type: &str) -> Result<Option<JobRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM jobs WHERE type = ? AND status IN ('pending', 'running')
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(job_type)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Counts grouped by (status, type), for the health/metrics endpoint.
    pub async fn job_stats(&self) -> Result<Vec<(String, String, i64)>> {
        let rows = sqlx::query("SELECT status, type, COUNT(*) as n FROM jobs GROUP BY status, type")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get("status"), r.get("type"), r.get::<i64, _>("n")))
            .collect())
    }

    /// Marks jobs stuck `running` past `grace` as `failed` ("worker lost").
    pub async fn recover_stale_jobs(&self, grace: Duration) -> Result<u64> {
        with_timeout(async {
            let cutoff = (Utc::now() - grace).to_rfc3339();
            let now = now_rfc3339();
            let n = sqlx::query(
                "UPDATE jobs SET status = 'failed', error = 'worker lost', completed_at = ?, updated_at = ?
                 WHERE status = 'running' AND started_at < ?",
            )
            .bind(&now)
            .bind(&now)
            .bind(&cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
            Ok(n)
        })
        .await
    }

    // ─── Permission requests ────────────────────────────────────────────────

    /// Create a permission request, superseding any older `pending` request
    /// for the same session in one transaction.
    pub async fn create_permission_request(
        &self,
        session_id: &str,
        tool_name: &str,
        tool_use_id: &str,
        input: &str,
    ) -> Result<PermissionRequestRow> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let now_s = now.to_rfc3339();
        let expires_at = (now + Duration::hours(24)).to_rfc3339();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE permission_requests SET status = 'superseded'
             WHERE session_id = ? AND status = 'pending'",
        )
        .bind(session_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO permission_requests (id, session_id, tool_name, tool_use_id, input, status, created_at, expires_at)
             VALUES (?, ?, ?, ?, ?, 'pending', ?, ?)",
        )
        .bind(&id)
        .bind(session_id)
        .bind(tool_name)
        .bind(tool_use_id)
        .bind(input)
        .bind(&now_s)
        .bind(&expires_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.get_permission_request(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("permission request not found after insert"))
    }

    pub async fn get_permission_request(&self, id: &str) -> Result<Option<PermissionRequestRow>> {
        Ok(sqlx::query_as("SELECT * FROM permission_requests WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn list_permission_requests(
        &self,
        session_id: Option<&str>,
        status: Option<&str>,
    ) -> Result<Vec<PermissionRequestRow>> {
        let mut sql = String::from("SELECT * FROM permission_requests WHERE 1=1");
        if session_id.is_some() {
            sql.push_str(" AND session_id = ?");
        }
        if status.is_some() {
            sql.push_str(" AND status = ?");
        }
        sql.push_str(" ORDER BY created_at DESC");
        let mut q = sqlx::query_as::<_, PermissionRequestRow>(&sql);
        if let Some(s) = session_id {
            q = q.bind(s);
        }
        if let Some(s) = status {
            q = q.bind(s);
        }
        Ok(q.fetch_all(&self.pool).await?)
    }

    /// Transition a `pending` request to `approved`/`denied`. Guarded by
    /// `status = 'pending'` so a racing expiry/supersession/decision loses
    /// cleanly. Returns whether this call made the transition.
    pub async fn decide_permission(&self, id: &str, decision: &str) -> Result<bool> {
        let status = match decision {
            "allow" => "approved",
            "deny" => "denied",
            other => anyhow::bail!("invalid decision: {other}"),
        };
        let now = now_rfc3339();
        let result = sqlx::query(
            "UPDATE permission_requests SET status = ?, decision = ?, decided_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(status)
        .bind(decision)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Supersede all pending permission requests for a session because a
    /// newer user message arrived.
    pub async fn expire_permissions_after_user_message(&self, session_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE permission_requests SET status = 'superseded'
             WHERE session_id = ? AND status = 'pending'",
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Flip `pending` requests past `expires_at` to `expired` — run by the
    /// periodic maintenance job.
    pub async fn expire_overdue_permissions(&self) -> Result<u64> {
        let now = now_rfc3339();
        let n = sqlx::query(
            "UPDATE permission_requests SET status = 'expired'
             WHERE status = 'pending' AND expires_at < ?",
        )
        .bind(&now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(n)
    }

    /// Batched pending-permission counts per session.
    pub async fn pending_permissions_count_per_session(
        &self,
        session_ids: &[String],
    ) -> Result<std::collections::HashMap<String, i64>> {
        if session_ids.is_empty() {
            return Ok(std::collections::HashMap::new());
        }
        let placeholders = vec!["?"; session_ids.len()].join(",");
        let sql = format!(
            "SELECT session_id, COUNT(*) as n FROM permission_requests
             WHERE status = 'pending' AND session_id IN ({placeholders})
             GROUP BY session_id"
        );
        let mut q = sqlx::query(&sql);
        for id in session_ids {
            q = q.bind(id);
        }
        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("session_id"), r.get::<i64, _>("n")))
            .collect())
    }

    /// Whether a decision on `permission` is still answerable: the request
    /// must still be `pending`, not expired, have an active job for its
    /// session, and no newer user event may exist.
    pub async fn permission_is_answerable(&self, permission: &PermissionRequestRow) -> Result<bool> {
        if permission.status != "pending" {
            return Ok(false);
        }
        if permission.expires_at.as_str() < now_rfc3339().as_str() {
            return Ok(false);
        }
        if self
            .active_session_runner_job(&permission.session_id)
            .await?
            .is_none()
        {
            return Ok(false);
        }
        let newer_user_event: Option<(String,)> = sqlx::query_as(
            "SELECT uuid FROM events
             WHERE memva_session_id = ? AND event_type = 'user' AND timestamp > ?
             LIMIT 1",
        )
        .bind(&permission.session_id)
        .bind(&permission.created_at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(newer_user_event.is_none())
    }

    // ─── Settings ───────────────────────────────────────────────────────────

    pub async fn get_global_settings(&self) -> Result<SettingsRow> {
        sqlx::query_as("SELECT * FROM settings WHERE id = 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| anyhow::anyhow!("global settings row missing: {e}"))
    }

    pub async fn update_global_settings(
        &self,
        max_turns: i64,
        permission_mode: &str,
        default_directory: Option<&str>,
    ) -> Result<SettingsRow> {
        let now = now_rfc3339();
        sqlx::query(
            "UPDATE settings SET max_turns = ?, permission_mode = ?, default_directory = ?, updated_at = ? WHERE id = 1",
        )
        .bind(max_turns)
        .bind(permission_mode)
        .bind(default_directory)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        self.get_global_settings().await
    }

    // ─── Startup recovery ───────────────────────────────────────────────────

    /// On daemon startup, anything left `processing`/`waiting_for_input`
    /// from a crashed process becomes `error`; stale `running` jobs become
    /// `failed` ("worker lost"). Returns (sessions_recovered, jobs_recovered).
    pub async fn recover_on_startup(&self) -> Result<(u64, u64)> {
        let now = now_rfc3339();
        let sessions = with_timeout(async {
            Ok(sqlx::query(
                "UPDATE sessions SET claude_status = 'error', updated_at = ?
                 WHERE claude_status IN ('processing', 'waiting_for_input')",
            )
            .bind(&now)
            .execute(&self.pool)
            .await?
            .rows_affected())
        })
        .await?;

        let jobs = self.recover_stale_jobs(Duration::seconds(0)).await?;
        Ok((sessions, jobs))
    }

    // ─── Maintenance ────────────────────────────────────────────────────────

    /// Delete archived sessions older than `days` days and return the count.
    /// Pass `0` to skip pruning.
    pub async fn prune_old_sessions(&self, days: u32) -> Result<u64> {
        if days == 0 {
            return Ok(0);
        }
        with_timeout(async {
            let cutoff = (Utc::now() - Duration::days(days as i64)).to_rfc3339();
            let n = sqlx::query("DELETE FROM sessions WHERE status = 'archived' AND updated_at < ?")
                .bind(&cutoff)
                .execute(&self.pool)
                .await?
                .rows_affected();
            Ok(n)
        })
        .await
    }

    /// Run SQLite VACUUM to reclaim disk space after pruning.
    pub async fn vacuum(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    /// Write a consistent snapshot of the database to `dest_path` via
    /// SQLite's online-backup `VACUUM INTO`, without blocking writers on the
    /// live pool for the whole copy.
    pub async fn backup_to(&self, dest_path: &Path) -> Result<()> {
        sqlx::query("VACUUM INTO ?")
            .bind(dest_path.to_string_lossy().as_ref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Repairs sessions left `processing`/`waiting_for_input` with no active
    /// `session-runner` job backing them — the same inconsistency
    /// `recover_on_startup` fixes after a crash, but detectable mid-run too
    /// (e.g. a worker panicked without the job reaching a terminal state).
    pub async fn sync_orphaned_sessions(&self) -> Result<u64> {
        let stuck: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM sessions WHERE claude_status IN ('processing', 'waiting_for_input')",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut fixed = 0u64;
        for (id,) in stuck {
            if self.active_session_runner_job(&id).await?.is_none() {
                self.update_claude_status(&id, "error").await?;
                fixed += 1;
            }
        }
        Ok(fixed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_fetch_session() {
        let store = Store::open_in_memory().await.unwrap();
        let s = store
            .create_session("/tmp/proj", Some("demo"), None, None)
            .await
            .unwrap();
        assert_eq!(s.status, "active");
        assert_eq!(s.claude_status, "not_started");
        let fetched = store.get_session(&s.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, s.id);
    }

    #[tokio::test]
    async fn claim_next_due_respects_priority_and_scheduling() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .enqueue_job(NewJob {
                job_type: "session-runner",
                data: "{}",
                priority: 1,
                max_attempts: 3,
                scheduled_at: None,
            })
            .await
            .unwrap();
        let high = store
            .enqueue_job(NewJob {
                job_type: "session-runner",
                data: "{}",
                priority: 10,
                max_attempts: 3,
                scheduled_at: None,
            })
            .await
            .unwrap();

        let claimed = store.claim_next_due(Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.id, high.id);
        assert_eq!(claimed.status, "running");
        assert_eq!(claimed.attempts, 1);

        // Future-scheduled jobs are skipped even at higher priority.
        store
            .enqueue_job(NewJob {
                job_type: "session-runner",
                data: "{}",
                priority: 99,
                max_attempts: 3,
                scheduled_at: Some(Utc::now() + Duration::hours(1)),
            })
            .await
            .unwrap();
        let next = store.claim_next_due(Utc::now()).await.unwrap().unwrap();
        assert_ne!(next.priority, 99);
    }

    #[tokio::test]
    async fn permission_supersession_marks_prior_pending_request() {
        let store = Store::open_in_memory().await.unwrap();
        let session = store.create_session("/tmp/p", None, None, None).await.unwrap();
        let first = store
            .create_permission_request(&session.id, "bash", "tu_1", "{}")
            .await
            .unwrap();
        let second = store
            .create_permission_request(&session.id, "bash", "tu_2", "{}")
            .await
            .unwrap();

        let first_after = store.get_permission_request(&first.id).await.unwrap().unwrap();
        assert_eq!(first_after.status, "superseded");
        assert_eq!(second.status, "pending");
    }

    #[tokio::test]
    async fn decide_permission_is_guarded_by_pending_status() {
        let store = Store::open_in_memory().await.unwrap();
        let session = store.create_session("/tmp/p", None, None, None).await.unwrap();
        let req = store
            .create_permission_request(&session.id, "bash", "tu_1", "{}")
            .await
            .unwrap();

        assert!(store.decide_permission(&req.id, "allow").await.unwrap());
        // Second decision on an already-decided request is a no-op.
        assert!(!store.decide_permission(&req.id, "deny").await.unwrap());

        let after = store.get_permission_request(&req.id).await.unwrap().unwrap();
        assert_eq!(after.status, "approved");
    }
}
