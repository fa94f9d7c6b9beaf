//! Session data model
//!
//! Records owned by session actors: the session itself, the messages in its
//! log, the ephemeral tool and permission state of an in-flight turn.

use super::rules::AlwaysAllowRule;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// =============================================================================
// Session
// =============================================================================

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Waiting for a prompt
    Idle,
    /// A turn is running
    Processing,
    /// A tool call is paused until a human decides
    AwaitingPermission,
    /// The agent failed; the next prompt retries
    Error,
    /// Agent stopped, record retained
    Ended,
    /// Agent stopped, record purged
    Deleted,
}

impl SessionStatus {
    /// Whether a turn is in flight
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Processing | Self::AwaitingPermission)
    }

    /// Whether the actor has stopped
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Deleted)
    }
}

/// How tool calls are gated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionMode {
    /// Tools are gated by the approval policy
    #[default]
    #[serde(rename = "default", alias = "read-only")]
    Default,
    /// Every tool runs without asking
    #[serde(rename = "allow-all", alias = "bypassPermissions", alias = "bypass")]
    AllowAll,
}

impl PermissionMode {
    /// Permission mode flag understood by the Claude Code CLI
    pub fn as_cli_flag(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AllowAll => "bypassPermissions",
        }
    }
}

/// One prior turn supplied when resuming a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

/// Immutable session creation parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Free-form system prompt
    pub system_prompt: Option<String>,
    /// Named agent profile
    pub agent_name: Option<String>,
    /// Tool allow-list (empty = engine default)
    pub tools: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub permission_mode: PermissionMode,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Prior conversation to resume from
    pub conversation_history: Vec<HistoryEntry>,
    /// Session the history was taken from
    pub original_session_id: Option<String>,
    /// Tool calls approved without asking
    pub always_allow_rules: Vec<AlwaysAllowRule>,
}

/// Where the session's instructions come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptSource<'a> {
    SystemPrompt(&'a str),
    Agent(&'a str),
    EngineDefault,
}

impl SessionOptions {
    /// Reject inconsistent options before an actor is spawned
    pub fn validate(&self) -> crate::Result<()> {
        if self.system_prompt.is_some() && self.agent_name.is_some() {
            return Err(crate::Error::InvalidOptions(
                "system_prompt and agent_name are mutually exclusive".to_string(),
            ));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(crate::Error::InvalidOptions(format!(
                    "temperature {} out of range 0.0..=2.0",
                    t
                )));
            }
        }
        for rule in &self.always_allow_rules {
            rule.validate()?;
        }
        Ok(())
    }

    pub fn prompt_source(&self) -> PromptSource<'_> {
        match (&self.system_prompt, &self.agent_name) {
            (Some(prompt), _) => PromptSource::SystemPrompt(prompt),
            (None, Some(agent)) => PromptSource::Agent(agent),
            (None, None) => PromptSource::EngineDefault,
        }
    }
}

/// Token usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

impl Usage {
    pub fn accumulate(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation_input_tokens += other.cache_creation_input_tokens;
        self.cache_read_input_tokens += other.cache_read_input_tokens;
    }
}

/// Accounting reported when a turn completes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnStats {
    pub cost_usd: f64,
    pub num_turns: u32,
    pub duration_ms: u64,
    pub usage: Usage,
    #[serde(default)]
    pub is_error: bool,
}

/// One interactive conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub options: SessionOptions,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: u64,
    pub cost_usd: f64,
    pub num_turns: u64,
    pub duration_ms: u64,
    pub usage: Usage,
    pub git_branch: Option<String>,
    pub error_message: Option<String>,
    /// Engine-side conversation id, used to resume the engine
    pub engine_session_id: Option<String>,
}

impl Session {
    /// Create a new idle session record
    pub fn new(id: impl Into<String>, options: SessionOptions) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: SessionStatus::Idle,
            options,
            created_at: now,
            updated_at: now,
            message_count: 0,
            cost_usd: 0.0,
            num_turns: 0,
            duration_ms: 0,
            usage: Usage::default(),
            git_branch: None,
            error_message: None,
            engine_session_id: None,
        }
    }

    /// Fold a completed turn into the running totals
    pub fn record_turn(&mut self, stats: &TurnStats) {
        self.cost_usd += stats.cost_usd;
        self.num_turns += u64::from(stats.num_turns);
        self.duration_ms += stats.duration_ms;
        self.usage.accumulate(&stats.usage);
        self.message_count += 1;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Validate a client-supplied session id (it keys files on disk)
pub fn validate_session_id(id: &str) -> crate::Result<()> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(crate::Error::InvalidSessionId(id.to_string()))
    }
}

// =============================================================================
// Messages
// =============================================================================

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Tool invocation attached to an assistant message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Output of a tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

/// Message payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Assistant {
        text: String,
        #[serde(default)]
        tools: Vec<ToolUse>,
        #[serde(default)]
        tool_results: Vec<ToolResult>,
    },
    User {
        text: String,
        #[serde(default)]
        tool_results: Vec<ToolResult>,
    },
    System {
        subtype: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Result {
        cost_usd: f64,
        num_turns: u32,
        duration_ms: u64,
        usage: Usage,
        #[serde(default)]
        is_error: bool,
    },
}

impl MessageContent {
    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            text: text.into(),
            tool_results: Vec::new(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant {
            text: text.into(),
            tools: Vec::new(),
            tool_results: Vec::new(),
        }
    }

    pub fn system(subtype: impl Into<String>, text: Option<String>) -> Self {
        Self::System {
            subtype: subtype.into(),
            text,
        }
    }

    pub fn result(stats: &TurnStats) -> Self {
        Self::Result {
            cost_usd: stats.cost_usd,
            num_turns: stats.num_turns,
            duration_ms: stats.duration_ms,
            usage: stats.usage,
            is_error: stats.is_error,
        }
    }

    /// Content for a resumed history entry
    pub fn from_history(entry: &HistoryEntry) -> Self {
        match entry.role {
            Role::User => Self::user(entry.content.clone()),
            Role::Assistant => Self::assistant(entry.content.clone()),
            Role::System => Self::system("history", Some(entry.content.clone())),
        }
    }

    /// Plain text carried by the content, if any
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Assistant { text, .. } | Self::User { text, .. } => Some(text),
            Self::System { text, .. } => text.as_deref(),
            Self::Result { .. } => None,
        }
    }
}

/// One appended unit of conversation content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub session_id: String,
    /// Gapless per-session ordering key, assigned by the message log
    pub sequence: u64,
    pub role: Role,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_uses: Option<Vec<ToolUse>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_content: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Message before the log assigns its sequence
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: Role,
    pub content: MessageContent,
    pub tool_uses: Option<Vec<ToolUse>>,
    pub thinking_content: Option<String>,
}

impl NewMessage {
    pub fn new(role: Role, content: MessageContent) -> Self {
        Self {
            role,
            content,
            tool_uses: None,
            thinking_content: None,
        }
    }
}

// =============================================================================
// In-flight turn state
// =============================================================================

/// Progress of a tool invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Running,
    Completed,
    Error,
}

/// A tool invocation the agent reported during the current turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveTool {
    pub id: String,
    pub session_id: String,
    pub name: String,
    pub input: serde_json::Value,
    pub status: ToolStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

/// A tool call paused until a human approves or denies it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub request_id: String,
    pub session_id: String,
    pub tool: String,
    pub tool_use_id: String,
    pub input: serde_json::Value,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}
