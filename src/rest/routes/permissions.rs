use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::MemvaError;
use crate::AppContext;

#[derive(Deserialize)]
pub struct ListQuery {
    pub session_id: Option<String>,
    pub status: Option<String>,
}

pub async fn list_permissions(
    State(ctx): State<Arc<AppContext>>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Value>, MemvaError> {
    let requests = ctx
        .permissions
        .list(q.session_id.as_deref(), q.status.as_deref())
        .await
        .map_err(MemvaError::Internal)?;
    Ok(Json(json!({ "requests": requests })))
}

#[derive(Deserialize)]
pub struct DecideRequest {
    pub decision: String,
}

pub async fn decide_permission(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Json(body): Json<DecideRequest>,
) -> Result<Json<Value>, MemvaError> {
    if body.decision != "allow" && body.decision != "deny" {
        return Err(MemvaError::Validation(
            "decision must be \"allow\" or \"deny\"".into(),
        ));
    }

    let request = ctx
        .permissions
        .get(&id)
        .await
        .map_err(MemvaError::Internal)?
        .ok_or_else(|| MemvaError::NotFound(format!("permission request {id}")))?;

    // Nominally `pending` is not enough: the request may have expired, lost
    // its backing job, or been superseded by a newer user message since.
    if !ctx
        .store
        .permission_is_answerable(&request)
        .await
        .map_err(MemvaError::Internal)?
    {
        return Err(MemvaError::Conflict(
            "request is no longer answerable (expired, no active job, or superseded by a newer message)".into(),
        ));
    }

    let applied = ctx
        .permissions
        .decide(&id, &body.decision)
        .await
        .map_err(MemvaError::Internal)?;
    if !applied {
        return Err(MemvaError::Conflict(
            "request is no longer pending (already decided, superseded, or expired)".into(),
        ));
    }
    Ok(Json(json!({ "decided": true })))
}
