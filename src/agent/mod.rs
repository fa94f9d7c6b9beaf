//! Agent engines
//!
//! Each session drives one engine through the [`AgentAdapter`] contract.
//!
//! ```text
//! SessionActor ──start/send/authorize/interrupt/terminate──► AgentAdapter
//!      ▲                                                        │
//!      └──────────────── AgentEvent stream ◄────────────────────┘
//!
//! ClaudeCliAdapter   claude --print --output-format stream-json (NDJSON over stdio)
//! ScriptedAdapter    in-process steps, used by `--engine echo` and tests
//! ```

pub mod adapter;
pub mod claude;
pub mod scripted;
pub mod types;

pub use adapter::{
    check_working_directory, AdapterFactory, AgentAdapter, AgentEvent, AgentEventStream,
    ToolDecision, EVENT_CHANNEL_CAPACITY,
};
pub use claude::{ClaudeCliAdapter, ClaudeCliFactory};
pub use scripted::{ProbeState, Script, ScriptProbe, ScriptStep, ScriptedAdapter, ScriptedFactory};
