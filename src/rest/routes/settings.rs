use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::MemvaError;
use crate::AppContext;

pub async fn get_settings(State(ctx): State<Arc<AppContext>>) -> Result<Json<Value>, MemvaError> {
    let settings = ctx.store.get_global_settings().await.map_err(MemvaError::Internal)?;
    Ok(Json(json!(settings)))
}

#[derive(Deserialize)]
pub struct UpdateSettingsRequest {
    pub max_turns: i64,
    pub permission_mode: String,
    pub default_directory: Option<String>,
}

pub async fn update_settings(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<UpdateSettingsRequest>,
) -> Result<Json<Value>, MemvaError> {
    let settings = ctx
        .store
        .update_global_settings(
            body.max_turns,
            &body.permission_mode,
            body.default_directory.as_deref(),
        )
        .await
        .map_err(MemvaError::Internal)?;
    Ok(Json(json!(settings)))
}
