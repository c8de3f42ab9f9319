//! `memva-permission-mcp` — the out-of-process permission broker sidecar.
//!
//! Spawned by the agent streamer alongside the agent subprocess, referenced
//! via `--permission-prompt-tool mcp__memva_permission__request`. Exposes a
//! single tool, `request`, that creates a `permission_requests` row for the
//! session named in its environment and blocks (polling the shared Store)
//! until a human decides, the request is superseded, or it expires.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use memva::mcp::{McpToolDef, McpToolServer};
use memva::permission::{Decision, PermissionBroker};
use memva::storage::Store;

struct PermissionServer {
    broker: PermissionBroker,
    session_id: String,
}

#[async_trait]
impl McpToolServer for PermissionServer {
    fn tools(&self) -> Vec<McpToolDef> {
        vec![McpToolDef {
            name: "request".into(),
            description: "Ask the user to approve or deny a tool call".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "tool_name": { "type": "string" },
                    "tool_use_id": { "type": "string" },
                    "input": { "type": "object" }
                },
                "required": ["tool_name", "tool_use_id", "input"]
            }),
        }]
    }

    async fn call_tool(&self, _name: &str, arguments: Value) -> Result<Value> {
        let tool_name = arguments
            .get("tool_name")
            .and_then(|v| v.as_str())
            .context("missing tool_name")?;
        let tool_use_id = arguments
            .get("tool_use_id")
            .and_then(|v| v.as_str())
            .context("missing tool_use_id")?;
        let input = arguments.get("input").cloned().unwrap_or(json!({})).to_string();

        let decision = self
            .broker
            .request_and_await(&self.session_id, tool_name, tool_use_id, &input)
            .await?;

        Ok(match decision {
            Decision::Allow => json!({ "behavior": "allow" }),
            Decision::Deny => json!({ "behavior": "deny", "message": "denied or expired" }),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let data_dir: PathBuf = std::env::var("MEMVA_DATA_DIR")
        .context("MEMVA_DATA_DIR not set")?
        .into();
    let env_name = std::env::var("MEMVA_ENV").unwrap_or_else(|_| "dev".to_string());
    let session_id = std::env::var("MEMVA_SESSION_ID").context("MEMVA_SESSION_ID not set")?;

    let store = Store::open(&data_dir, &env_name).await?;
    let broker = PermissionBroker::new(store);
    let server = PermissionServer { broker, session_id };

    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    memva::mcp::serve(stdin, stdout, &server).await
}
