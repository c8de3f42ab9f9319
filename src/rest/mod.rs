//! Public REST API — axum HTTP server bridging REST calls onto the Store,
//! job queue, and permission broker.
//!
//! Endpoints:
//!   GET  /api/v1/health
//!   GET  /api/v1/sessions
//!   POST /api/v1/sessions
//!   GET  /api/v1/sessions/:id
//!   POST /api/v1/sessions/:id/archive
//!   POST /api/v1/sessions/:id/messages
//!   POST /api/v1/sessions/:id/abort
//!   GET  /api/v1/sessions/:id/job
//!   GET  /api/v1/sessions/:id/events        (SSE live-tail)
//!   GET  /api/v1/sessions/:id/events/poll    {events, session_status, has_more, latest_event_id, latest_timestamp}
//!   GET  /api/v1/permissions
//!   POST /api/v1/permissions/:id/decide
//!   GET  /api/v1/settings
//!   PUT  /api/v1/settings
//!   GET  /api/session/:sessionId/settings
//!   PUT  /api/session/:sessionId/settings

pub mod routes;
pub mod sse;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::AppContext;

pub async fn start_rest_server(ctx: Arc<AppContext>) -> Result<()> {
    let addr: SocketAddr = format!("127.0.0.1:{}", ctx.config.port).parse()?;
    let router = build_router(ctx);

    info!(%addr, "REST API listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/api/v1/health", get(routes::health::health))
        .route(
            "/api/v1/sessions",
            get(routes::sessions::list_sessions).post(routes::sessions::create_session),
        )
        .route("/api/v1/sessions/:id", get(routes::sessions::get_session))
        .route(
            "/api/v1/sessions/:id/archive",
            post(routes::sessions::archive_session),
        )
        .route(
            "/api/v1/sessions/:id/messages",
            post(routes::sessions::submit_message),
        )
        .route(
            "/api/v1/sessions/:id/abort",
            post(routes::sessions::abort_session),
        )
        .route("/api/v1/sessions/:id/job", get(routes::sessions::active_job))
        .route("/api/v1/sessions/:id/events", get(sse::session_events_sse))
        .route(
            "/api/v1/sessions/:id/events/poll",
            get(routes::sessions::poll_events),
        )
        .route(
            "/api/v1/permissions",
            get(routes::permissions::list_permissions),
        )
        .route(
            "/api/v1/permissions/:id/decide",
            post(routes::permissions::decide_permission),
        )
        .route(
            "/api/v1/settings",
            get(routes::settings::get_settings).put(routes::settings::update_settings),
        )
        .route(
            "/api/session/:sessionId/settings",
            get(routes::sessions::get_session_settings).put(routes::sessions::update_session_settings),
        )
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}
