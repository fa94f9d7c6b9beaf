//! agentdeck - Live agent session orchestrator
//!
//! agentdeck runs many concurrent coding-agent sessions on behalf of
//! interactive control terminals. Each session drives one agent engine,
//! streams its output to every connected client, gates tool use behind
//! human approval, and persists its transcript so it can be resumed.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        agentdeck gateway                         │
//! │   /ws  /health  /api/sessions                                    │
//! │        │                                                         │
//! │  ┌─────▼──────┐   commands   ┌──────────────────┐                │
//! │  │ Dispatcher ├─────────────►│ SessionRegistry  │                │
//! │  └─────▲──────┘              └────────┬─────────┘                │
//! │        │ replies                      │ one actor per session    │
//! │        │                   ┌──────────▼──────────┐               │
//! │        │                   │    session actor    │               │
//! │        │                   │  gate · tools · log │               │
//! │        │                   └───┬────────────┬────┘               │
//! │  ┌─────┴────────────┐  events  │            │ AgentEvent         │
//! │  │ EventBroadcaster │◄─────────┘   ┌────────▼─────────┐          │
//! │  └──────────────────┘              │   AgentAdapter   │          │
//! │                                    │ claude · scripted│          │
//! │  ┌──────────────────┐              └──────────────────┘          │
//! │  │ Storage          │  session records + message logs            │
//! │  └──────────────────┘                                            │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`gateway`]: HTTP and WebSocket surface
//! - [`protocol`]: Client commands, server events, dispatch and fan-out
//! - [`session`]: Session model, permission gate and per-session actors
//! - [`agent`]: Agent engine adapters
//! - [`store`]: Session and message persistence
//! - [`config`]: Configuration management

pub mod agent;
pub mod config;
pub mod error;
pub mod gateway;
pub mod git;
pub mod protocol;
pub mod session;
pub mod store;

pub use config::AgentdeckConfig;
pub use error::{Error, Result};
