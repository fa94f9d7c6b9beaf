//! Tool approval policy and permission prompt descriptions

use super::types::PermissionMode;
use std::collections::HashSet;

/// Decides whether a tool call must wait for a human
pub trait ApprovalPolicy: Send + Sync {
    fn requires_approval(&self, tool: &str, mode: PermissionMode) -> bool;
}

impl<F> ApprovalPolicy for F
where
    F: Fn(&str, PermissionMode) -> bool + Send + Sync,
{
    fn requires_approval(&self, tool: &str, mode: PermissionMode) -> bool {
        self(tool, mode)
    }
}

/// Default policy: `allow-all` never asks; `default` asks for every tool,
/// or only for the listed ones when a list is configured.
#[derive(Debug, Clone, Default)]
pub struct ModePolicy {
    only: Option<HashSet<String>>,
}

impl ModePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict approval in `default` mode to these tools
    pub fn only(tools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            only: Some(tools.into_iter().map(Into::into).collect()),
        }
    }
}

impl ApprovalPolicy for ModePolicy {
    fn requires_approval(&self, tool: &str, mode: PermissionMode) -> bool {
        match mode {
            PermissionMode::AllowAll => false,
            PermissionMode::Default => match &self.only {
                Some(tools) => tools.contains(tool),
                None => true,
            },
        }
    }
}

/// Human-readable summary of a tool call for the approval prompt
pub fn describe_tool_call(tool: &str, input: &serde_json::Value) -> String {
    let field = |key: &str| input.get(key).and_then(|v| v.as_str());

    let described = match tool {
        "Bash" => field("command").map(|c| format!("Execute command: {}", c)),
        "Read" => field("file_path").map(|p| format!("Read file: {}", p)),
        "Write" => field("file_path").map(|p| format!("Write to file: {}", p)),
        "Edit" | "MultiEdit" => field("file_path").map(|p| format!("Edit file: {}", p)),
        "Glob" => field("pattern").map(|p| format!("Search files matching: {}", p)),
        "Grep" => field("pattern").map(|p| format!("Search content matching: {}", p)),
        "WebSearch" => field("query").map(|q| format!("Web search: {}", q)),
        "WebFetch" => field("url").map(|u| format!("Fetch URL: {}", u)),
        _ => None,
    };
    described.unwrap_or_else(|| format!("Use {} tool", tool))
}
