//! Event pipeline — append-only log access plus poll-based SSE live-tail.
//!
//! An in-memory `tokio::sync::broadcast` channel would lose everything on
//! reconnect. Clients here need to resume a tail after a dropped connection,
//! so live-tail instead re-polls `Store::events_since` on a fixed interval,
//! keyed by the last timestamp the client has seen.

use std::time::Duration;

use anyhow::Result;
use futures_util::{stream, Stream};

use crate::storage::{EventRow, Store};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct EventPipeline {
    store: Store,
}

impl EventPipeline {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn append(
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
        self.store
            .append_event(
                memva_session_id,
                session_id,
                event_type,
                timestamp,
                parent_uuid,
                is_sidechain,
                cwd,
                project_name,
                data,
                visible,
            )
            .await
    }

    pub async fn history(&self, memva_session_id: &str, include_hidden: bool) -> Result<Vec<EventRow>> {
        self.store.events_for_session(memva_session_id, include_hidden).await
    }

    /// A stream of batches of new events since `since` (or the full history
    /// if `since` is `None`), polling every 500ms. Each yielded `Vec` is in
    /// chronological order. Ends only when the caller drops it — callers
    /// reconnecting after a disconnect should pass the last timestamp they
    /// saw back in as `since`.
    pub fn live_tail(
        &self,
        memva_session_id: String,
        since: Option<String>,
        include_hidden: bool,
    ) -> impl Stream<Item = Result<Vec<EventRow>>> {
        struct State {
            store: Store,
            memva_session_id: String,
            cursor: Option<String>,
            include_hidden: bool,
        }
        let init = State {
            store: self.store.clone(),
            memva_session_id,
            cursor: since,
            include_hidden,
        };

        stream::unfold(init, |mut state| async move {
            tokio::time::sleep(POLL_INTERVAL).await;
            let since = state.cursor.clone().unwrap_or_default();
            let result = state
                .store
                .events_since(&state.memva_session_id, &since, state.include_hidden)
                .await;
            let batch = match result {
                Ok(mut rows) => {
                    // `events_since` returns newest-first; live-tail consumers
                    // want chronological order.
                    rows.reverse();
                    if let Some(last) = rows.last() {
                        state.cursor = Some(last.timestamp.clone());
                    }
                    Ok(rows)
                }
                Err(e) => Err(e),
            };
            Some((batch, state))
        })
    }
}
