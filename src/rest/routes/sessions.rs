use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::MemvaError;
use crate::storage::SessionSettingsOverride;
use crate::AppContext;

const VALID_PERMISSION_MODES: [&str; 4] = ["default", "acceptEdits", "bypassPermissions", "plan"];

pub async fn list_sessions(
    State(ctx): State<Arc<AppContext>>,
) -> Result<Json<Value>, MemvaError> {
    let sessions = ctx.store.list_sessions().await.map_err(MemvaError::Internal)?;
    let ids: Vec<String> = sessions.iter().map(|s| s.id.clone()).collect();
    let pending = ctx
        .store
        .pending_permissions_count_per_session(&ids)
        .await
        .map_err(MemvaError::Internal)?;
    let list: Vec<Value> = sessions
        .into_iter()
        .map(|s| {
            json!({
                "id": s.id,
                "title": s.title,
                "projectPath": s.project_path,
                "status": s.status,
                "claudeStatus": s.claude_status,
                "pendingPermissions": pending.get(&s.id).copied().unwrap_or(0),
                "createdAt": s.created_at,
                "updatedAt": s.updated_at,
            })
        })
        .collect();
    Ok(Json(json!({ "sessions": list })))
}

pub async fn get_session(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, MemvaError> {
    let session = ctx
        .store
        .get_session(&id)
        .await
        .map_err(MemvaError::Internal)?
        .ok_or_else(|| MemvaError::NotFound(format!("session {id}")))?;
    Ok(Json(json!({
        "id": session.id,
        "title": session.title,
        "projectPath": session.project_path,
        "status": session.status,
        "claudeStatus": session.claude_status,
        "settings": session.settings,
        "createdAt": session.created_at,
        "updatedAt": session.updated_at,
    })))
}

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub project_path: String,
    pub title: Option<String>,
    pub settings: Option<Value>,
}

pub async fn create_session(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<CreateSessionRequest>,
) -> Result<Json<Value>, MemvaError> {
    if body.project_path.trim().is_empty() {
        return Err(MemvaError::Validation("project_path is required".into()));
    }
    let settings = body.settings.map(|v| v.to_string());
    let session = ctx
        .store
        .create_session(&body.project_path, body.title.as_deref(), settings.as_deref(), None)
        .await
        .map_err(MemvaError::Internal)?;
    Ok(Json(json!({ "id": session.id, "status": session.status })))
}

#[derive(Deserialize)]
pub struct SubmitMessageRequest {
    pub content: String,
    #[serde(default)]
    pub priority: i64,
}

/// Enqueue one `session-runner` job for this session's next turn. Refuses
/// to enqueue a second turn while one is already pending/running — the
/// caller should wait for it to finish or call abort first.
pub async fn submit_message(
    State(ctx): State<Arc<AppContext>>,
    Path(session_id): Path<String>,
    Json(body): Json<SubmitMessageRequest>,
) -> Result<Json<Value>, MemvaError> {
    ctx.store
        .get_session(&session_id)
        .await
        .map_err(MemvaError::Internal)?
        .ok_or_else(|| MemvaError::NotFound(format!("session {session_id}")))?;

    if ctx
        .queue
        .active_session_runner_job(&session_id)
        .await
        .map_err(MemvaError::Internal)?
        .is_some()
    {
        return Err(MemvaError::Conflict(
            "a turn is already running for this session".into(),
        ));
    }

    let data = json!({ "sessionId": session_id, "content": body.content }).to_string();
    let job = ctx
        .queue
        .enqueue("session-runner", &data, body.priority, 3)
        .await
        .map_err(MemvaError::Internal)?;
    Ok(Json(json!({ "jobId": job.id, "status": job.status })))
}

pub async fn active_job(
    State(ctx): State<Arc<AppContext>>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, MemvaError> {
    let job = ctx
        .queue
        .active_session_runner_job(&session_id)
        .await
        .map_err(MemvaError::Internal)?;
    Ok(Json(json!({ "job": job })))
}

/// Request (deferred) abort of the session's in-flight turn, if any.
pub async fn abort_session(
    State(ctx): State<Arc<AppContext>>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, MemvaError> {
    let registry = ctx.abort_registry.lock().await;
    match registry.get(&session_id) {
        Some(flags) => {
            flags.request();
            Ok(Json(json!({ "aborting": true })))
        }
        None => Ok(Json(json!({ "aborting": false, "reason": "no turn in flight" }))),
    }
}

pub async fn archive_session(
    State(ctx): State<Arc<AppContext>>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, MemvaError> {
    ctx.store.archive_session(&session_id).await.map_err(MemvaError::Internal)?;
    Ok(Json(json!({ "status": "archived" })))
}

pub async fn get_session_settings(
    State(ctx): State<Arc<AppContext>>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, MemvaError> {
    ctx.store
        .get_session(&session_id)
        .await
        .map_err(MemvaError::Internal)?
        .ok_or_else(|| MemvaError::NotFound(format!("session {session_id}")))?;
    let over = ctx
        .store
        .session_settings_override(&session_id)
        .await
        .map_err(MemvaError::Internal)?;
    Ok(Json(json!(over)))
}

#[derive(Deserialize)]
pub struct UpdateSessionSettingsRequest {
    pub max_turns: Option<i64>,
    pub permission_mode: Option<String>,
    pub default_directory: Option<String>,
}

pub async fn update_session_settings(
    State(ctx): State<Arc<AppContext>>,
    Path(session_id): Path<String>,
    Json(body): Json<UpdateSessionSettingsRequest>,
) -> Result<Json<Value>, MemvaError> {
    ctx.store
        .get_session(&session_id)
        .await
        .map_err(MemvaError::Internal)?
        .ok_or_else(|| MemvaError::NotFound(format!("session {session_id}")))?;

    if let Some(max_turns) = body.max_turns {
        if max_turns <= 0 {
            return Err(MemvaError::Validation("max_turns must be positive".into()));
        }
    }
    if let Some(mode) = &body.permission_mode {
        if !VALID_PERMISSION_MODES.contains(&mode.as_str()) {
            return Err(MemvaError::Validation(format!(
                "permission_mode must be one of {VALID_PERMISSION_MODES:?}"
            )));
        }
    }

    let over = SessionSettingsOverride {
        max_turns: body.max_turns,
        permission_mode: body.permission_mode,
        default_directory: body.default_directory,
    };
    let serialized = serde_json::to_string(&over).map_err(|e| MemvaError::Internal(e.into()))?;
    ctx.store
        .update_session_settings(&session_id, &serialized)
        .await
        .map_err(MemvaError::Internal)?;
    Ok(Json(json!(over)))
}

#[derive(Deserialize)]
pub struct PollEventsQuery {
    pub since_timestamp: Option<String>,
    pub since_event_id: Option<String>,
    #[serde(default)]
    pub include_all: bool,
}

/// JSON-polling alternative to the SSE live-tail, for clients that prefer
/// to pull on their own schedule rather than hold a streaming connection.
pub async fn poll_events(
    State(ctx): State<Arc<AppContext>>,
    Path(session_id): Path<String>,
    Query(q): Query<PollEventsQuery>,
) -> Result<Json<Value>, MemvaError> {
    let session = ctx
        .store
        .get_session(&session_id)
        .await
        .map_err(MemvaError::Internal)?
        .ok_or_else(|| MemvaError::NotFound(format!("session {session_id}")))?;

    let since_timestamp = if let Some(event_id) = &q.since_event_id {
        let event = ctx
            .store
            .get_event(event_id)
            .await
            .map_err(MemvaError::Internal)?
            .ok_or_else(|| MemvaError::NotFound(format!("event {event_id}")))?;
        Some(event.timestamp)
    } else {
        q.since_timestamp.clone()
    };

    let events = match &since_timestamp {
        Some(ts) => {
            let mut rows = ctx
                .store
                .events_since(&session_id, ts, q.include_all)
                .await
                .map_err(MemvaError::Internal)?;
            rows.reverse();
            rows
        }
        None => ctx
            .store
            .events_for_session(&session_id, q.include_all)
            .await
            .map_err(MemvaError::Internal)?,
    };

    let latest_event_id = events.last().map(|e| e.uuid.clone());
    let latest_timestamp = events.last().map(|e| e.timestamp.clone());

    Ok(Json(json!({
        "events": events,
        "session_status": session.claude_status,
        // Every matching event is returned in one response; there is no
        // page-size cap to run out of.
        "has_more": false,
        "latest_event_id": latest_event_id,
        "latest_timestamp": latest_timestamp,
    })))
}
