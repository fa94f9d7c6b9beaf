//! NDJSON protocol types for Claude Code CLI communication
//!
//! The CLI runs with `--input-format stream-json --output-format stream-json`;
//! every stdout line is one [`CliMessage`] and every stdin line is one of the
//! messages built by the `*_ndjson` helpers below.

use serde::Deserialize;

// =============================================================================
// CLI → orchestrator messages (NDJSON)
// =============================================================================

/// Top-level CLI message (parsed from one NDJSON line)
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CliMessage {
    System(CliSystemMessage),
    Assistant(CliAssistantMessage),
    User(CliUserMessage),
    Result(CliResultMessage),
    ControlRequest(CliControlRequestMessage),
    StreamEvent(serde_json::Value),
    ControlResponse(serde_json::Value),
    KeepAlive,
}

/// System message (subtype: "init" or "status")
#[derive(Debug, Clone, Deserialize)]
pub struct CliSystemMessage {
    pub subtype: String,
    pub session_id: Option<String>,
    pub cwd: Option<String>,
    pub model: Option<String>,
    #[serde(rename = "permissionMode")]
    pub permission_mode: Option<String>,
}

/// Assistant message (complete model response)
#[derive(Debug, Clone, Deserialize)]
pub struct CliAssistantMessage {
    pub message: MessageBody,
    pub parent_tool_use_id: Option<String>,
    pub session_id: Option<String>,
}

/// User message echoed by the CLI, carrying tool results
#[derive(Debug, Clone, Deserialize)]
pub struct CliUserMessage {
    pub message: UserMessageBody,
    pub parent_tool_use_id: Option<String>,
}

/// Body of an assistant message
#[derive(Debug, Clone, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
}

/// Body of a user message; content is plain text or blocks
#[derive(Debug, Clone, Deserialize)]
pub struct UserMessageBody {
    pub content: UserContent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// Content block within a message
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
    Thinking {
        thinking: String,
    },
    #[serde(other)]
    Unknown,
}

/// Result message (turn completion)
#[derive(Debug, Clone, Deserialize)]
pub struct CliResultMessage {
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    pub result: Option<String>,
    pub duration_ms: Option<u64>,
    pub num_turns: Option<u32>,
    pub total_cost_usd: Option<f64>,
    pub usage: Option<CliUsage>,
    pub session_id: Option<String>,
}

/// Token counters reported with a result
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CliUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

/// Control request (permission prompt from CLI)
#[derive(Debug, Clone, Deserialize)]
pub struct CliControlRequestMessage {
    pub request_id: String,
    pub request: ControlRequestBody,
}

/// Body of a control request
#[derive(Debug, Clone, Deserialize)]
pub struct ControlRequestBody {
    pub subtype: String,
    pub tool_name: Option<String>,
    pub input: Option<serde_json::Value>,
    pub tool_use_id: Option<String>,
}

// =============================================================================
// Helper functions
// =============================================================================

/// Parse one NDJSON line, logging and skipping malformed input
pub fn parse_cli_line(line: &str) -> Option<CliMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    serde_json::from_str::<CliMessage>(line)
        .map_err(|e| {
            let preview = &line[..line.len().min(200)];
            tracing::warn!("NDJSON parse error: {} (line: {})", e, preview);
        })
        .ok()
}

/// Flatten tool result content (string or block list) to text
pub fn tool_result_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

/// Convert a user prompt to CLI NDJSON format
pub fn user_message_to_cli_ndjson(content: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": content,
        },
        "parent_tool_use_id": null,
    })
}

/// Convert a permission allow response to CLI NDJSON format
pub fn permission_allow_to_cli_ndjson(
    request_id: &str,
    updated_input: &serde_json::Value,
) -> serde_json::Value {
    serde_json::json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": {
                "behavior": "allow",
                "updatedInput": updated_input,
            },
        }
    })
}

/// Convert a permission deny response to CLI NDJSON format
pub fn permission_deny_to_cli_ndjson(request_id: &str, message: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": {
                "behavior": "deny",
                "message": message,
            }
        }
    })
}

/// Create an interrupt control request for CLI
pub fn interrupt_to_cli_ndjson() -> serde_json::Value {
    serde_json::json!({
        "type": "control_request",
        "request_id": uuid::Uuid::new_v4().to_string(),
        "request": {
            "subtype": "interrupt",
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_system_init_message() {
        let line = r#"{"type":"system","subtype":"init","session_id":"cli-1","cwd":"/tmp","tools":["Bash"],"model":"claude-sonnet-4-20250514","permissionMode":"default"}"#;
        match parse_cli_line(line) {
            Some(CliMessage::System(sys)) => {
                assert_eq!(sys.subtype, "init");
                assert_eq!(sys.session_id.as_deref(), Some("cli-1"));
                assert_eq!(sys.permission_mode.as_deref(), Some("default"));
            }
            other => panic!("Expected system message, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_assistant_with_tool_use() {
        let line = r#"{"type":"assistant","message":{"id":"msg_1","role":"assistant","model":"m","content":[{"type":"text","text":"Running it"},{"type":"tool_use","id":"toolu_1","name":"Bash","input":{"command":"ls"}}],"stop_reason":"tool_use"},"parent_tool_use_id":null,"session_id":"cli-1"}"#;
        match parse_cli_line(line) {
            Some(CliMessage::Assistant(msg)) => {
                assert_eq!(msg.message.content.len(), 2);
                match &msg.message.content[1] {
                    ContentBlock::ToolUse { id, name, input } => {
                        assert_eq!(id, "toolu_1");
                        assert_eq!(name, "Bash");
                        assert_eq!(input["command"], "ls");
                    }
                    other => panic!("Expected tool_use block, got {:?}", other),
                }
            }
            other => panic!("Expected assistant message, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_user_tool_result() {
        let line = r#"{"type":"user","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"toolu_1","content":[{"type":"text","text":"a.txt"},{"type":"text","text":"b.txt"}]}]},"parent_tool_use_id":null}"#;
        match parse_cli_line(line) {
            Some(CliMessage::User(msg)) => match &msg.message.content {
                UserContent::Blocks(blocks) => match &blocks[0] {
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => {
                        assert_eq!(tool_use_id, "toolu_1");
                        assert_eq!(tool_result_text(content), "a.txt\nb.txt");
                        assert!(!is_error);
                    }
                    other => panic!("Expected tool_result, got {:?}", other),
                },
                other => panic!("Expected blocks, got {:?}", other),
            },
            other => panic!("Expected user message, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_result_with_usage() {
        let line = r#"{"type":"result","subtype":"success","is_error":false,"result":"done","duration_ms":1200,"num_turns":2,"total_cost_usd":0.013,"usage":{"input_tokens":100,"output_tokens":40},"session_id":"cli-1"}"#;
        match parse_cli_line(line) {
            Some(CliMessage::Result(result)) => {
                assert_eq!(result.num_turns, Some(2));
                let usage = result.usage.unwrap();
                assert_eq!(usage.input_tokens, 100);
                assert_eq!(usage.cache_read_input_tokens, 0);
            }
            other => panic!("Expected result message, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_can_use_tool_request() {
        let line = r#"{"type":"control_request","request_id":"req-9","request":{"subtype":"can_use_tool","tool_name":"Write","input":{"file_path":"/tmp/x"},"tool_use_id":"toolu_2"}}"#;
        match parse_cli_line(line) {
            Some(CliMessage::ControlRequest(req)) => {
                assert_eq!(req.request_id, "req-9");
                assert_eq!(req.request.subtype, "can_use_tool");
                assert_eq!(req.request.tool_use_id.as_deref(), Some("toolu_2"));
            }
            other => panic!("Expected control request, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_block_type_is_tolerated() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"redacted_thinking","data":"x"},{"type":"text","text":"hi"}]},"parent_tool_use_id":null}"#;
        match parse_cli_line(line) {
            Some(CliMessage::Assistant(msg)) => {
                assert!(matches!(msg.message.content[0], ContentBlock::Unknown));
            }
            other => panic!("Expected assistant message, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_lines_skipped() {
        assert!(parse_cli_line("").is_none());
        assert!(parse_cli_line("not json").is_none());
        assert!(parse_cli_line(r#"{"type":"never_heard_of_it"}"#).is_none());
        assert!(matches!(
            parse_cli_line(r#"{"type":"keep_alive"}"#),
            Some(CliMessage::KeepAlive)
        ));
    }

    #[test]
    fn test_outbound_ndjson_shapes() {
        let msg = user_message_to_cli_ndjson("hello");
        assert_eq!(msg["type"], "user");
        assert_eq!(msg["message"]["content"], "hello");

        let allow = permission_allow_to_cli_ndjson("req-1", &serde_json::json!({"command": "ls"}));
        assert_eq!(allow["response"]["request_id"], "req-1");
        assert_eq!(allow["response"]["response"]["behavior"], "allow");
        assert_eq!(allow["response"]["response"]["updatedInput"]["command"], "ls");

        let deny = permission_deny_to_cli_ndjson("req-2", "not now");
        assert_eq!(deny["response"]["response"]["behavior"], "deny");
        assert_eq!(deny["response"]["response"]["message"], "not now");

        let interrupt = interrupt_to_cli_ndjson();
        assert_eq!(interrupt["request"]["subtype"], "interrupt");
    }
}
