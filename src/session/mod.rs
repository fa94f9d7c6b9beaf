//! Sessions: data model, per-session actors and the registry that owns them

pub mod actor;
pub mod gate;
pub mod policy;
pub mod registry;
pub mod rules;
pub mod types;

pub use actor::{ActorContext, ActorSettings, SessionHandle};
pub use gate::{PermissionGate, Resolution};
pub use policy::{describe_tool_call, ApprovalPolicy, ModePolicy};
pub use registry::{BulkOutcome, SessionRegistry};
pub use rules::{AlwaysAllowRule, RuleMatchMode, RulePattern};
pub use types::{
    Message, MessageContent, PermissionMode, PermissionRequest, Role, Session, SessionOptions,
    SessionStatus,
};
