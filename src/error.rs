//! Typed errors that cross an API boundary (HTTP responses, job outcomes).
//!
//! Internal plumbing still returns `anyhow::Result` throughout the store and
//! worker pool; `MemvaError` is reserved for the handful of cases that need
//! a distinct HTTP status code at the REST boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemvaError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient I/O error: {0}")]
    Transient(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl MemvaError {
    pub fn status_code(&self) -> u16 {
        match self {
            MemvaError::Validation(_) => 400,
            MemvaError::NotFound(_) => 404,
            MemvaError::Conflict(_) => 409,
            MemvaError::Transient(_) => 500,
            MemvaError::Internal(_) => 500,
        }
    }
}

impl axum::response::IntoResponse for MemvaError {
    fn into_response(self) -> axum::response::Response {
        let status = axum::http::StatusCode::from_u16(self.status_code())
            .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
