//! `GET /api/v1/sessions/:id/events` — Server-Sent Events live-tail.
//!
//! Built on axum's `Sse` wrapping a `stream` adapter, with its source fed by
//! [`EventPipeline::live_tail`] — a poll-based stream keyed by timestamp,
//! not an in-memory broadcast subscription — so a client that reconnects
//! with `?since=<timestamp>` resumes rather than missing events emitted
//! while it was disconnected.

use axum::{
    extract::{Path, Query, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use futures_util::{stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::error::MemvaError;
use crate::AppContext;

#[derive(Deserialize)]
pub struct TailQuery {
    pub since: Option<String>,
    #[serde(default)]
    pub include_hidden: bool,
}

pub async fn session_events_sse(
    State(ctx): State<Arc<AppContext>>,
    Path(session_id): Path<String>,
    Query(q): Query<TailQuery>,
) -> Response {
    let session = match ctx.store.get_session(&session_id).await {
        Ok(Some(s)) => s,
        Ok(None) => return MemvaError::NotFound(format!("session {session_id}")).into_response(),
        Err(e) => return MemvaError::Internal(e).into_response(),
    };

    // The stream opens with a `connection` frame carrying the current
    // status, so a client knows whether a run is already in flight before
    // the first event arrives.
    let connection_frame = Event::default().event("connection").data(
        json!({ "type": "connection", "sessionStatus": session.claude_status }).to_string(),
    );
    let connection_frame = stream::once(async move {
        Ok::<Event, std::convert::Infallible>(connection_frame)
    });

    let event_frames = ctx
        .events
        .live_tail(session_id, q.since, q.include_hidden)
        .flat_map(|batch| {
            let events: Vec<_> = match batch {
                Ok(rows) => rows
                    .into_iter()
                    .map(|row| {
                        Ok::<Event, std::convert::Infallible>(
                            Event::default()
                                .event(row.event_type.clone())
                                .id(row.uuid.clone())
                                .data(
                                    json!({
                                        "uuid": row.uuid,
                                        "event_type": row.event_type,
                                        "timestamp": row.timestamp,
                                        "memva_session_id": row.memva_session_id,
                                        "data": row.data,
                                    })
                                    .to_string(),
                                ),
                        )
                    })
                    .collect(),
                Err(_) => Vec::new(),
            };
            stream::iter(events)
        });

    Sse::new(connection_frame.chain(event_frames))
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("ping"),
        )
        .into_response()
}
