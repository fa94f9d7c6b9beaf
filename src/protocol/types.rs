//! Wire protocol between clients and the orchestrator
//!
//! Every message is a JSON object with a `type` discriminator.

use crate::session::rules::AlwaysAllowRule;
use crate::session::types::{
    Message, MessageContent, PermissionRequest, Role, Session, SessionOptions,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Page size when `load_messages` gives no limit
pub const DEFAULT_PAGE_LIMIT: usize = 50;
/// Page size substituted for an out-of-range limit
pub const FALLBACK_PAGE_LIMIT: usize = 100;
/// Largest accepted page size
pub const MAX_PAGE_LIMIT: usize = 1000;

// =============================================================================
// Client → Server commands
// =============================================================================

/// Command received from a client connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    CreateSession {
        session_id: String,
        #[serde(default)]
        options: SessionOptions,
    },
    LoadMessages {
        session_id: String,
        #[serde(default)]
        limit: Option<i64>,
        #[serde(default)]
        offset: Option<i64>,
    },
    SendPrompt {
        session_id: String,
        prompt: String,
    },
    PermissionResponse {
        session_id: String,
        request_id: String,
        approved: bool,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        remember: bool,
    },
    EndSession {
        session_id: String,
    },
    InterruptSession {
        session_id: String,
    },
    DeleteSession {
        session_id: String,
    },
    DismissTool {
        session_id: String,
        tool_use_id: String,
    },
    AddAlwaysAllowRule {
        session_id: String,
        rule: AlwaysAllowRule,
        /// Pending request the rule was created from; approved along with it
        #[serde(default)]
        permission_id: Option<String>,
    },
    RemoveAlwaysAllowRule {
        session_id: String,
        rule_id: String,
    },
    ListAlwaysAllowRules {
        session_id: String,
    },
    DeleteAllSessions,
    KillAllAgents,
    ListSessions,
    Ping,
}

impl ClientCommand {
    /// Session addressed by the command, if any
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::CreateSession { session_id, .. }
            | Self::LoadMessages { session_id, .. }
            | Self::SendPrompt { session_id, .. }
            | Self::PermissionResponse { session_id, .. }
            | Self::EndSession { session_id }
            | Self::InterruptSession { session_id }
            | Self::DeleteSession { session_id }
            | Self::DismissTool { session_id, .. }
            | Self::AddAlwaysAllowRule { session_id, .. }
            | Self::RemoveAlwaysAllowRule { session_id, .. }
            | Self::ListAlwaysAllowRules { session_id } => Some(session_id),
            Self::DeleteAllSessions | Self::KillAllAgents | Self::ListSessions | Self::Ping => None,
        }
    }
}

/// Normalize wire pagination to `(limit, offset)`
pub fn normalize_page(limit: Option<i64>, offset: Option<i64>) -> (usize, usize) {
    let limit = match limit {
        None => DEFAULT_PAGE_LIMIT,
        Some(l) if l >= 1 && l <= MAX_PAGE_LIMIT as i64 => l as usize,
        Some(_) => FALLBACK_PAGE_LIMIT,
    };
    let offset = offset.filter(|o| *o > 0).unwrap_or(0) as usize;
    (limit, offset)
}

// =============================================================================
// Server → Client events
// =============================================================================

/// Extra detail attached to `agent_message`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Log sequence, when the message has been appended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    /// First content after an approved tool ran
    #[serde(default)]
    pub post_tool_result: bool,
}

/// Event sent to client connections
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    SessionCreated {
        session_id: String,
        session: Session,
    },
    SessionUpdated {
        session_id: String,
        session: Session,
    },
    SessionEnded {
        session_id: String,
    },
    SessionInterrupted {
        session_id: String,
    },
    SessionDeleted {
        session_id: String,
    },
    AgentMessage {
        session_id: String,
        /// Chunks of one streaming message share this id
        message_id: String,
        role: Role,
        content: MessageContent,
        metadata: MessageMetadata,
    },
    AgentThinking {
        session_id: String,
        thinking: bool,
    },
    AgentToolUse {
        session_id: String,
        tool_use_id: String,
        tool: String,
        parameters: serde_json::Value,
    },
    ToolDismissed {
        session_id: String,
        tool_use_id: String,
    },
    PermissionRequest {
        session_id: String,
        request_id: String,
        tool_use_id: String,
        tool: String,
        parameters: serde_json::Value,
        description: String,
        timestamp: DateTime<Utc>,
    },
    PermissionAcknowledged {
        session_id: String,
        request_id: String,
        approved: bool,
        status: String,
    },
    SessionsList {
        sessions: Vec<Session>,
    },
    AlwaysAllowRulesList {
        session_id: String,
        rules: Vec<AlwaysAllowRule>,
    },
    MessagesLoaded {
        session_id: String,
        messages: Vec<Message>,
        has_more: bool,
        count: usize,
        limit: usize,
        offset: usize,
    },
    AgentsKilled {
        count: usize,
        failed: usize,
    },
    AllSessionsDeleted {
        count: usize,
        failed: usize,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        message: String,
    },
    Pong,
}

impl ServerEvent {
    pub fn permission_request(request: &PermissionRequest) -> Self {
        Self::PermissionRequest {
            session_id: request.session_id.clone(),
            request_id: request.request_id.clone(),
            tool_use_id: request.tool_use_id.clone(),
            tool: request.tool.clone(),
            parameters: request.input.clone(),
            description: request.description.clone(),
            timestamp: request.timestamp,
        }
    }

    pub fn error(session_id: Option<&str>, message: impl Into<String>) -> Self {
        Self::Error {
            session_id: session_id.map(str::to_string),
            message: message.into(),
        }
    }

    /// Session the event concerns, if any
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SessionCreated { session_id, .. }
            | Self::SessionUpdated { session_id, .. }
            | Self::SessionEnded { session_id }
            | Self::SessionInterrupted { session_id }
            | Self::SessionDeleted { session_id }
            | Self::AgentMessage { session_id, .. }
            | Self::AgentThinking { session_id, .. }
            | Self::AgentToolUse { session_id, .. }
            | Self::ToolDismissed { session_id, .. }
            | Self::PermissionRequest { session_id, .. }
            | Self::PermissionAcknowledged { session_id, .. }
            | Self::MessagesLoaded { session_id, .. }
            | Self::AlwaysAllowRulesList { session_id, .. } => Some(session_id),
            Self::Error { session_id, .. } => session_id.as_deref(),
            Self::SessionsList { .. }
            | Self::AgentsKilled { .. }
            | Self::AllSessionsDeleted { .. }
            | Self::Pong => None,
        }
    }

    /// Wire name of the event
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session_created",
            Self::SessionUpdated { .. } => "session_updated",
            Self::SessionEnded { .. } => "session_ended",
            Self::SessionInterrupted { .. } => "session_interrupted",
            Self::SessionDeleted { .. } => "session_deleted",
            Self::AgentMessage { .. } => "agent_message",
            Self::AgentThinking { .. } => "agent_thinking",
            Self::AgentToolUse { .. } => "agent_tool_use",
            Self::ToolDismissed { .. } => "tool_dismissed",
            Self::PermissionRequest { .. } => "permission_request",
            Self::PermissionAcknowledged { .. } => "permission_acknowledged",
            Self::SessionsList { .. } => "sessions_list",
            Self::AlwaysAllowRulesList { .. } => "always_allow_rules_list",
            Self::MessagesLoaded { .. } => "messages_loaded",
            Self::AgentsKilled { .. } => "agents_killed",
            Self::AllSessionsDeleted { .. } => "all_sessions_deleted",
            Self::Error { .. } => "error",
            Self::Pong => "pong",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::PermissionMode;

    #[test]
    fn test_decode_create_session() {
        let cmd: ClientCommand = serde_json::from_str(
            r#"{"type":"create_session","session_id":"s1","options":{"permission_mode":"allow-all","tools":["Read"],"conversation_history":[{"role":"user","content":"hi"}],"original_session_id":"old"}}"#,
        )
        .unwrap();
        match cmd {
            ClientCommand::CreateSession {
                session_id,
                options,
            } => {
                assert_eq!(session_id, "s1");
                assert_eq!(options.permission_mode, PermissionMode::AllowAll);
                assert_eq!(options.conversation_history.len(), 1);
                assert_eq!(options.original_session_id.as_deref(), Some("old"));
            }
            other => panic!("Expected CreateSession, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_without_options_and_unit_commands() {
        let cmd: ClientCommand =
            serde_json::from_str(r#"{"type":"create_session","session_id":"s2"}"#).unwrap();
        assert_eq!(cmd.session_id(), Some("s2"));

        let cmd: ClientCommand = serde_json::from_str(r#"{"type":"kill_all_agents"}"#).unwrap();
        assert!(matches!(cmd, ClientCommand::KillAllAgents));
        assert_eq!(cmd.session_id(), None);

        let cmd: ClientCommand =
            serde_json::from_str(r#"{"type":"delete_all_sessions"}"#).unwrap();
        assert!(matches!(cmd, ClientCommand::DeleteAllSessions));
    }

    #[test]
    fn test_decode_permission_response_defaults() {
        let cmd: ClientCommand = serde_json::from_str(
            r#"{"type":"permission_response","session_id":"s1","request_id":"r1","approved":false}"#,
        )
        .unwrap();
        match cmd {
            ClientCommand::PermissionResponse {
                approved,
                reason,
                remember,
                ..
            } => {
                assert!(!approved);
                assert!(reason.is_none());
                assert!(!remember);
            }
            other => panic!("Expected PermissionResponse, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_bad_commands() {
        assert!(serde_json::from_str::<ClientCommand>(r#"{"type":"launch_rockets"}"#).is_err());
        assert!(serde_json::from_str::<ClientCommand>(r#"{"type":"send_prompt"}"#).is_err());
        assert!(serde_json::from_str::<ClientCommand>(r#"{"session_id":"s1"}"#).is_err());
    }

    #[test]
    fn test_normalize_page() {
        assert_eq!(normalize_page(None, None), (DEFAULT_PAGE_LIMIT, 0));
        assert_eq!(normalize_page(Some(20), Some(40)), (20, 40));
        assert_eq!(normalize_page(Some(0), None), (FALLBACK_PAGE_LIMIT, 0));
        assert_eq!(normalize_page(Some(5000), None), (FALLBACK_PAGE_LIMIT, 0));
        assert_eq!(normalize_page(Some(1000), Some(-3)), (1000, 0));
    }

    #[test]
    fn test_event_encoding() {
        let event = ServerEvent::AllSessionsDeleted {
            count: 3,
            failed: 0,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "all_sessions_deleted");
        assert_eq!(json["count"], 3);

        let event = ServerEvent::error(None, "bad input");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "error");
        assert!(json.get("session_id").is_none());

        let json = serde_json::to_value(&ServerEvent::Pong).unwrap();
        assert_eq!(json, serde_json::json!({"type": "pong"}));
    }

    #[test]
    fn test_kind_matches_wire_tag() {
        let events = vec![
            ServerEvent::SessionEnded {
                session_id: "s1".to_string(),
            },
            ServerEvent::AgentThinking {
                session_id: "s1".to_string(),
                thinking: true,
            },
            ServerEvent::AgentsKilled {
                count: 1,
                failed: 0,
            },
            ServerEvent::AlwaysAllowRulesList {
                session_id: "s1".to_string(),
                rules: Vec::new(),
            },
            ServerEvent::Pong,
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.kind());
        }
    }

    #[test]
    fn test_decode_always_allow_commands() {
        let cmd: ClientCommand = serde_json::from_str(
            r#"{"type":"add_always_allow_rule","session_id":"s1","permission_id":"req-1","rule":{"tool":"Read","match_mode":"pattern","pattern":{"directory_path":"/repo/src"}}}"#,
        )
        .unwrap();
        match &cmd {
            ClientCommand::AddAlwaysAllowRule {
                rule,
                permission_id,
                ..
            } => {
                assert_eq!(rule.tool, "Read");
                assert!(rule.id.is_empty());
                assert_eq!(permission_id.as_deref(), Some("req-1"));
            }
            other => panic!("Expected AddAlwaysAllowRule, got {:?}", other),
        }
        assert_eq!(cmd.session_id(), Some("s1"));

        let cmd: ClientCommand = serde_json::from_str(
            r#"{"type":"remove_always_allow_rule","session_id":"s1","rule_id":"r1"}"#,
        )
        .unwrap();
        assert!(matches!(cmd, ClientCommand::RemoveAlwaysAllowRule { ref rule_id, .. } if rule_id == "r1"));

        let cmd: ClientCommand =
            serde_json::from_str(r#"{"type":"list_always_allow_rules","session_id":"s1"}"#).unwrap();
        assert_eq!(cmd.session_id(), Some("s1"));
    }
}
