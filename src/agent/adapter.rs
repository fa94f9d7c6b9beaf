//! Agent process adapter contract
//!
//! A session actor drives exactly one adapter. The adapter hides how the
//! agent engine is launched and spoken to; the actor only sees the ordered
//! [`AgentEvent`] stream and the handful of calls below.

use crate::session::types::{Role, SessionOptions, TurnStats};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Capacity of an adapter's event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event emitted by an agent engine
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// The engine started or stopped thinking about the current prompt
    Thinking(bool),
    /// Reasoning text for the current message
    ThinkingText(String),
    /// The engine announced a tool invocation
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// The engine is paused until [`AgentAdapter::authorize`] is called for this tool
    ToolApproval {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// A tool finished
    ToolResult {
        id: String,
        content: String,
        is_error: bool,
    },
    /// A piece of message text
    ContentChunk { role: Role, text: String },
    /// The turn is over
    TurnComplete(TurnStats),
    /// The engine's own conversation id, used to resume it later
    EngineSession(String),
    /// The engine failed and will produce nothing more
    Fatal(String),
}

/// Receiving half of an adapter's event stream
pub type AgentEventStream = mpsc::Receiver<AgentEvent>;

/// Decision for a tool paused by [`AgentEvent::ToolApproval`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolDecision {
    Allow,
    Deny { reason: String },
}

impl ToolDecision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Uniform interface over one agent engine instance
#[async_trait]
pub trait AgentAdapter: Send {
    /// Short engine name for logs
    fn name(&self) -> &'static str;

    /// Launch the engine; `resume` is the engine conversation id to continue
    async fn start(&mut self, options: &SessionOptions, resume: Option<&str>) -> crate::Result<()>;

    /// Take the event stream of the current run (available once per start)
    fn events(&mut self) -> Option<AgentEventStream>;

    /// Deliver one user turn
    async fn send(&mut self, prompt: &str) -> crate::Result<()>;

    /// Allow or deny a tool the engine paused on
    async fn authorize(&mut self, tool_use_id: &str, decision: &ToolDecision) -> crate::Result<()>;

    /// Abort the in-flight turn, best effort
    async fn interrupt(&mut self) -> crate::Result<()>;

    /// Stop the engine; calling it again is a no-op
    async fn terminate(&mut self) -> crate::Result<()>;
}

/// Creates one adapter per session
pub trait AdapterFactory: Send + Sync {
    fn create(&self, session_id: &str) -> Box<dyn AgentAdapter>;
}

/// Validate the working directory shared by all engines
pub async fn check_working_directory(options: &SessionOptions) -> crate::Result<()> {
    if let Some(dir) = &options.working_directory {
        let is_dir = tokio::fs::metadata(dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(crate::Error::Startup(format!(
                "Working directory does not exist: {}",
                dir.display()
            )));
        }
    }
    Ok(())
}
