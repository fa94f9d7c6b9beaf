//! Permission gate
//!
//! Correlates the single outstanding approval request of a session with the
//! client's response. Owned by the session actor; never shared.

use super::policy::describe_tool_call;
use super::types::PermissionRequest;
use crate::agent::ToolDecision;
use tokio::time::{Duration, Instant};

/// Reason recorded when a decision is forced by teardown
pub const DENIED_ON_TEARDOWN: &str = "Session ended before a decision was made";
/// Reason recorded when the approval deadline passes
pub const DENIED_ON_TIMEOUT: &str = "Permission request timed out";
/// Reason recorded when the agent dies while a request is open
pub const DENIED_ON_FAILURE: &str = "Agent stopped before a decision was made";

/// A resolved request and the decision taken
#[derive(Debug, Clone)]
pub struct Resolution {
    pub request: PermissionRequest,
    pub decision: ToolDecision,
    /// Approve later calls of this tool without asking
    pub remember: bool,
}

struct Pending {
    request: PermissionRequest,
    deadline: Option<Instant>,
}

/// Per-session approval state
#[derive(Default)]
pub struct PermissionGate {
    pending: Option<Pending>,
}

impl PermissionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a request for a paused tool call
    ///
    /// Fails if one is already outstanding: a session never has two.
    pub fn request(
        &mut self,
        session_id: &str,
        tool_use_id: &str,
        tool: &str,
        input: &serde_json::Value,
        timeout: Option<Duration>,
    ) -> crate::Result<PermissionRequest> {
        if let Some(pending) = &self.pending {
            return Err(crate::Error::Internal(format!(
                "permission request {} still pending",
                pending.request.request_id
            )));
        }

        let request = PermissionRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            tool: tool.to_string(),
            tool_use_id: tool_use_id.to_string(),
            input: input.clone(),
            description: describe_tool_call(tool, input),
            timestamp: chrono::Utc::now(),
        };
        self.pending = Some(Pending {
            request: request.clone(),
            deadline: timeout.map(|t| Instant::now() + t),
        });
        Ok(request)
    }

    /// Resolve the outstanding request with the client's decision
    pub fn resolve(
        &mut self,
        request_id: &str,
        approved: bool,
        reason: Option<String>,
        remember: bool,
    ) -> crate::Result<Resolution> {
        match &self.pending {
            Some(pending) if pending.request.request_id == request_id => {}
            _ => return Err(crate::Error::UnknownRequest(request_id.to_string())),
        }
        let Some(pending) = self.pending.take() else {
            return Err(crate::Error::UnknownRequest(request_id.to_string()));
        };

        let decision = if approved {
            ToolDecision::Allow
        } else {
            ToolDecision::Deny {
                reason: reason.unwrap_or_else(|| "Denied by user".to_string()),
            }
        };
        Ok(Resolution {
            request: pending.request,
            decision,
            remember: approved && remember,
        })
    }

    /// Deny whatever is outstanding (teardown, interrupt, timeout)
    pub fn force_deny(&mut self, reason: &str) -> Option<Resolution> {
        self.pending.take().map(|pending| Resolution {
            request: pending.request,
            decision: ToolDecision::Deny {
                reason: reason.to_string(),
            },
            remember: false,
        })
    }

    pub fn pending(&self) -> Option<&PermissionRequest> {
        self.pending.as_ref().map(|p| &p.request)
    }

    /// When the outstanding request auto-denies, if ever
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().and_then(|p| p.deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_pending_request() {
        let mut gate = PermissionGate::new();
        let req = gate
            .request("s1", "t1", "Bash", &json!({"command": "ls"}), None)
            .unwrap();
        assert_eq!(req.description, "Execute command: ls");
        assert_eq!(gate.pending().unwrap().request_id, req.request_id);

        let err = gate
            .request("s1", "t2", "Write", &json!({}), None)
            .unwrap_err();
        assert!(matches!(err, crate::Error::Internal(_)));
        assert_eq!(gate.pending().unwrap().tool_use_id, "t1");
    }

    #[test]
    fn test_fresh_request_ids() {
        let mut gate = PermissionGate::new();
        let first = gate.request("s1", "t1", "Bash", &json!({}), None).unwrap();
        gate.resolve(&first.request_id, true, None, false).unwrap();
        let second = gate.request("s1", "t2", "Bash", &json!({}), None).unwrap();
        assert_ne!(first.request_id, second.request_id);
    }

    #[test]
    fn test_resolve_approve_and_duplicate() {
        let mut gate = PermissionGate::new();
        let req = gate.request("s1", "t1", "Bash", &json!({}), None).unwrap();

        let resolution = gate.resolve(&req.request_id, true, None, false).unwrap();
        assert_eq!(resolution.decision, ToolDecision::Allow);
        assert!(gate.pending().is_none());

        let err = gate
            .resolve(&req.request_id, true, None, false)
            .unwrap_err();
        assert!(matches!(err, crate::Error::UnknownRequest(_)));
    }

    #[test]
    fn test_resolve_wrong_id_keeps_pending() {
        let mut gate = PermissionGate::new();
        let req = gate.request("s1", "t1", "Bash", &json!({}), None).unwrap();

        assert!(gate.resolve("bogus", false, None, false).is_err());
        assert_eq!(gate.pending().unwrap().request_id, req.request_id);
    }

    #[test]
    fn test_deny_reason() {
        let mut gate = PermissionGate::new();
        let req = gate.request("s1", "t1", "Bash", &json!({}), None).unwrap();
        let resolution = gate
            .resolve(&req.request_id, false, Some("too risky".to_string()), false)
            .unwrap();
        assert_eq!(
            resolution.decision,
            ToolDecision::Deny {
                reason: "too risky".to_string()
            }
        );

        let req = gate.request("s1", "t2", "Bash", &json!({}), None).unwrap();
        let resolution = gate.resolve(&req.request_id, false, None, false).unwrap();
        assert_eq!(
            resolution.decision,
            ToolDecision::Deny {
                reason: "Denied by user".to_string()
            }
        );
    }

    #[test]
    fn test_remember_only_on_approval() {
        let mut gate = PermissionGate::new();
        let req = gate.request("s1", "t1", "Edit", &json!({}), None).unwrap();
        assert!(gate.resolve(&req.request_id, true, None, true).unwrap().remember);

        let req = gate.request("s1", "t2", "Edit", &json!({}), None).unwrap();
        assert!(!gate.resolve(&req.request_id, false, None, true).unwrap().remember);
    }

    #[test]
    fn test_force_deny_and_deadline() {
        let mut gate = PermissionGate::new();
        assert!(gate.force_deny(DENIED_ON_TEARDOWN).is_none());

        gate.request("s1", "t1", "Bash", &json!({}), Some(Duration::from_secs(30)))
            .unwrap();
        assert!(gate.deadline().is_some());

        let resolution = gate.force_deny(DENIED_ON_TEARDOWN).unwrap();
        assert!(!resolution.decision.is_allow());
        assert!(gate.pending().is_none());
        assert!(gate.deadline().is_none());
    }
}
