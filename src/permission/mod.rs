//! Permission broker — the service layer sitting between the MCP sidecar
//! (which asks "can the agent run this tool?") and the Store's
//! `permission_requests` table.
//!
//! Store-backed rather than an in-process `tokio::sync::broadcast` channel:
//! the asking side (the sidecar) and the deciding side (the REST API) are
//! separate OS processes here, so the Store is the only thing both can see.

use std::time::Duration;

use anyhow::Result;

use crate::storage::{PermissionRequestRow, Store};

#[derive(Clone)]
pub struct PermissionBroker {
    store: Store,
    poll_interval: Duration,
}

impl PermissionBroker {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            poll_interval: Duration::from_millis(500),
        }
    }

    /// Create a permission request (superseding any prior pending one for
    /// the session) and block until it is decided, expires, or is
    /// superseded by a newer request.
    pub async fn request_and_await(
        &self,
        session_id: &str,
        tool_name: &str,
        tool_use_id: &str,
        input: &str,
    ) -> Result<Decision> {
        let request = self
            .store
            .create_permission_request(session_id, tool_name, tool_use_id, input)
            .await?;

        loop {
            let current = self
                .store
                .get_permission_request(&request.id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("permission request disappeared"))?;

            match current.status.as_str() {
                "approved" => return Ok(Decision::Allow),
                "denied" => return Ok(Decision::Deny),
                "superseded" => return Ok(Decision::Deny),
                "expired" => return Ok(Decision::Deny),
                "pending" => {
                    if !self.store.permission_is_answerable(&current).await? {
                        return Ok(Decision::Deny);
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
                other => anyhow::bail!("unexpected permission request status: {other}"),
            }
        }
    }

    pub async fn decide(&self, id: &str, decision: &str) -> Result<bool> {
        self.store.decide_permission(id, decision).await
    }

    pub async fn list(
        &self,
        session_id: Option<&str>,
        status: Option<&str>,
    ) -> Result<Vec<PermissionRequestRow>> {
        self.store.list_permission_requests(session_id, status).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<PermissionRequestRow>> {
        self.store.get_permission_request(id).await
    }

    /// A new user message supersedes any pending permission request for its
    /// session — the agent's next turn will re-request if it still needs to.
    pub async fn expire_after_user_message(&self, session_id: &str) -> Result<()> {
        self.store.expire_permissions_after_user_message(session_id).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn decide_unblocks_request_and_await() {
        let store = Store::open_in_memory().await.unwrap();
        let session = store.create_session("/tmp/p", None, None, None).await.unwrap();
        // Seed an active job so `permission_is_answerable` passes.
        store
            .enqueue_job(crate::storage::NewJob {
                job_type: "session-runner",
                data: &serde_json::json!({ "sessionId": session.id }).to_string(),
                priority: 0,
                max_attempts: 1,
                scheduled_at: None,
            })
            .await
            .unwrap();

        let broker = PermissionBroker {
            store: store.clone(),
            poll_interval: Duration::from_millis(10),
        };

        let id = session.id.clone();
        let waiter = tokio::spawn(async move {
            broker
                .request_and_await(&id, "bash", "tu_1", "{}")
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        let pending = store
            .list_permission_requests(Some(&session.id), Some("pending"))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        store.decide_permission(&pending[0].id, "allow").await.unwrap();

        assert_eq!(waiter.await.unwrap(), Decision::Allow);
    }
}
