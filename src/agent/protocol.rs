//! Parsing for the agent subprocess's `stream-json` stdout protocol.
//!
//! Only the fields memva's core depends on (session id, message role/content,
//! tool use, turn completion) are modeled as real variants; everything else —
//! and the full original payload of every variant — is preserved verbatim in
//! [`RawAgentValue`] so it can be stored in `events.data` without loss.

use serde::Deserialize;
use serde_json::Value;

/// Wraps an arbitrary JSON payload the way it was received, so the event
/// pipeline can persist and later replay it without needing to understand
/// every field the agent might emit.
#[derive(Debug, Clone)]
pub struct RawAgentValue(pub Value);

impl RawAgentValue {
    pub fn to_string(&self) -> String {
        self.0.to_string()
    }
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentLine {
    System {
        subtype: Option<String>,
        session_id: Option<String>,
        cwd: Option<String>,
    },
    Assistant {
        message: AgentMessage,
        session_id: Option<String>,
        parent_tool_use_id: Option<String>,
    },
    User {
        message: AgentMessage,
        session_id: Option<String>,
        parent_tool_use_id: Option<String>,
    },
    Result {
        subtype: String,
        is_error: Option<bool>,
        result: Option<String>,
        session_id: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug)]
pub struct AgentMessage {
    pub role: String,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

impl AgentMessage {
    /// Concatenated visible text across all `Text` blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// First `ToolUse` block, if the assistant requested a tool call.
    pub fn tool_use(&self) -> Option<(&str, &str, &Value)> {
        self.content.iter().find_map(|b| match b {
            ContentBlock::ToolUse { id, name, input } => Some((id.as_str(), name.as_str(), input)),
            _ => None,
        })
    }
}

/// Parse one line of the agent's stdout. Returns `None` (and logs) for lines
/// that are not valid JSON at all; unrecognized `type` values still parse to
/// `AgentLine::Unknown` via the `#[serde(other)]` arm.
pub fn parse_line(line: &str) -> Option<(AgentLine, RawAgentValue)> {
    let raw: Value = serde_json::from_str(line).ok()?;
    let parsed: AgentLine = serde_json::from_value(raw.clone()).ok()?;
    Some((parsed, RawAgentValue(raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_assistant_text_message() {
        let line = r#"{"type":"assistant","session_id":"abc","message":{"role":"assistant","content":[{"type":"text","text":"hi"}]}}"#;
        let (parsed, raw) = parse_line(line).unwrap();
        match parsed {
            AgentLine::Assistant { message, session_id, .. } => {
                assert_eq!(message.text(), "hi");
                assert_eq!(session_id.as_deref(), Some("abc"));
            }
            _ => panic!("wrong variant"),
        }
        assert!(raw.to_string().contains("\"text\":\"hi\""));
    }

    #[test]
    fn parses_tool_use_block() {
        let line = r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"tool_use","id":"tu_1","name":"Bash","input":{"command":"ls"}}]}}"#;
        let (parsed, _) = parse_line(line).unwrap();
        match parsed {
            AgentLine::Assistant { message, .. } => {
                let (id, name, _) = message.tool_use().unwrap();
                assert_eq!(id, "tu_1");
                assert_eq!(name, "Bash");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_type_does_not_fail_parsing() {
        let line = r#"{"type":"some_future_type","foo":"bar"}"#;
        let (parsed, _) = parse_line(line).unwrap();
        assert!(matches!(parsed, AgentLine::Unknown));
    }
}
