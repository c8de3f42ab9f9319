//! Server-side MCP (Model Context Protocol) stdio framing.
//!
//! The permission sidecar (`memva-permission-mcp`) speaks this on its own
//! stdin/stdout — the agent subprocess is the client, and this module plays
//! the server role: JSON-RPC-over-stdio, one object per line, the usual
//! `initialize`/`initialized` handshake.
//!
//! Protocol version: 2024-11-05.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

pub const MCP_PARSE_ERROR: i64 = -32700;
pub const MCP_INVALID_REQUEST: i64 = -32600;
pub const MCP_METHOD_NOT_FOUND: i64 = -32601;
pub const MCP_INVALID_PARAMS: i64 = -32602;
pub const MCP_INTERNAL_ERROR: i64 = -32603;

/// A single MCP tool definition, as returned from `tools/list`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct McpToolDef {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Implemented by whatever tool set the sidecar exposes — one method per
/// MCP request it needs to answer.
#[async_trait]
pub trait McpToolServer: Send + Sync {
    fn tools(&self) -> Vec<McpToolDef>;
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value>;
}

/// Read JSON-RPC requests line-by-line from `input` and write responses to
/// `output` until stdin closes. One object per line.
pub async fn serve<R, W>(input: R, mut output: W, server: &dyn McpToolServer) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(input).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(&line, server).await;
        if let Some(response) = response {
            let mut text = serde_json::to_string(&response)?;
            text.push('\n');
            output.write_all(text.as_bytes()).await?;
            output.flush().await?;
        }
    }
    Ok(())
}

async fn handle_line(line: &str, server: &dyn McpToolServer) -> Option<Value> {
    let request: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return Some(error_response(Value::Null, MCP_PARSE_ERROR, &e.to_string())),
    };

    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request.get("method").and_then(|m| m.as_str()).unwrap_or("");
    let params = request.get("params").cloned().unwrap_or(Value::Null);

    // Notifications (no "id") never get a response, matching JSON-RPC 2.0.
    let is_notification = request.get("id").is_none();

    let result = match method {
        "initialize" => Ok(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": { "tools": {} },
            "serverInfo": { "name": "memva-permission-mcp", "version": env!("CARGO_PKG_VERSION") }
        })),
        "initialized" | "notifications/initialized" => Ok(Value::Null),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({ "tools": server.tools() })),
        "tools/call" => handle_tools_call(params, server).await,
        other => Err((MCP_METHOD_NOT_FOUND, format!("unknown method: {other}"))),
    };

    if is_notification {
        return None;
    }

    Some(match result {
        Ok(value) => json!({ "jsonrpc": "2.0", "id": id, "result": value }),
        Err((code, message)) => error_response(id, code, &message),
    })
}

async fn handle_tools_call(
    params: Value,
    server: &dyn McpToolServer,
) -> std::result::Result<Value, (i64, String)> {
    let name = params
        .get("name")
        .and_then(|v| v.as_str())
        .ok_or((MCP_INVALID_PARAMS, "missing tool name".to_string()))?;
    let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

    server
        .call_tool(name, arguments)
        .await
        .map(|content| {
            json!({ "content": [{ "type": "text", "text": content.to_string() }] })
        })
        .map_err(|e| (MCP_INTERNAL_ERROR, e.to_string()))
}

fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoServer;

    #[async_trait]
    impl McpToolServer for EchoServer {
        fn tools(&self) -> Vec<McpToolDef> {
            vec![McpToolDef {
                name: "echo".into(),
                description: "echoes input".into(),
                input_schema: json!({ "type": "object" }),
            }]
        }
        async fn call_tool(&self, _name: &str, arguments: Value) -> Result<Value> {
            Ok(arguments)
        }
    }

    #[tokio::test]
    async fn initialize_then_tools_call_round_trips() {
        let input = b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"initialize\",\"params\":{}}\n{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"tools/call\",\"params\":{\"name\":\"echo\",\"arguments\":{\"x\":1}}}\n";
        let mut output = Vec::new();
        serve(&input[..], &mut output, &EchoServer).await.unwrap();
        let text = String::from_utf8(output).unwrap();
        let mut responses = text.lines().map(|l| serde_json::from_str::<Value>(l).unwrap());
        let first = responses.next().unwrap();
        assert_eq!(first["result"]["protocolVersion"], "2024-11-05");
        let second = responses.next().unwrap();
        assert!(second["result"]["content"][0]["text"].as_str().unwrap().contains("\"x\":1"));
    }
}
