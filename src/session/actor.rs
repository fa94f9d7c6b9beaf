//! Session actor
//!
//! One tokio task per session. The actor is the only code that mutates its
//! session: commands arrive through a bounded mailbox, agent output through
//! the adapter's event stream, and the current record is published through a
//! watch channel so readers never enter the actor.
//!
//! ```text
//! SessionHandle ──mpsc──► SessionActor ◄──AgentEventStream── AgentAdapter
//!       ▲                    │  │  │
//!       └──watch<Session>────┘  │  └──► EventBroadcaster ──► connections
//!                               └─────► MessageLog / SessionStore
//! ```

use super::gate::{
    PermissionGate, Resolution, DENIED_ON_FAILURE, DENIED_ON_TEARDOWN, DENIED_ON_TIMEOUT,
};
use super::policy::{ApprovalPolicy, ModePolicy};
use super::rules::{self, AlwaysAllowRule};
use super::types::{
    ActiveTool, MessageContent, NewMessage, PermissionRequest, Role, Session, SessionStatus,
    ToolResult, ToolStatus, ToolUse, TurnStats,
};
use crate::agent::{AgentAdapter, AgentEvent, AgentEventStream, ToolDecision};
use crate::config::AgentdeckConfig;
use crate::protocol::{EventBroadcaster, MessageMetadata, ServerEvent};
use crate::store::Storage;
use std::collections::{HashMap, VecDeque};
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

const DENIED_ON_INTERRUPT: &str = "Interrupted by user";
const DENIED_OUTSIDE_TURN: &str = "No turn in progress";

/// Knobs shared by every actor of a registry
#[derive(Clone)]
pub struct ActorSettings {
    pub policy: Arc<dyn ApprovalPolicy>,
    /// Auto-deny pending approvals after this long
    pub approval_timeout: Option<Duration>,
    /// How long a finished tool stays listed
    pub tool_linger: Duration,
    pub mailbox_capacity: usize,
}

impl ActorSettings {
    pub fn from_config(config: &AgentdeckConfig) -> Self {
        let policy: Arc<dyn ApprovalPolicy> = match &config.permissions.approval_required_tools {
            Some(tools) => Arc::new(ModePolicy::only(tools.iter().cloned())),
            None => Arc::new(ModePolicy::new()),
        };
        Self {
            policy,
            approval_timeout: config
                .permissions
                .approval_timeout_secs
                .map(Duration::from_secs),
            tool_linger: Duration::from_secs(config.permissions.tool_linger_secs),
            mailbox_capacity: config.agent.mailbox_capacity.max(1),
        }
    }
}

impl Default for ActorSettings {
    fn default() -> Self {
        Self::from_config(&AgentdeckConfig::default())
    }
}

/// Shared collaborators handed to every actor
#[derive(Clone)]
pub struct ActorContext {
    pub storage: Storage,
    pub events: EventBroadcaster,
    pub settings: Arc<ActorSettings>,
}

type Reply<T = ()> = oneshot::Sender<crate::Result<T>>;

enum Command {
    SendPrompt {
        prompt: String,
        reply: Reply,
    },
    RespondPermission {
        request_id: String,
        approved: bool,
        reason: Option<String>,
        remember: bool,
        reply: Reply,
    },
    Interrupt {
        reply: Reply,
    },
    DismissTool {
        tool_use_id: String,
        reply: Reply,
    },
    AddRule {
        rule: AlwaysAllowRule,
        permission_id: Option<String>,
        reply: Reply<Vec<AlwaysAllowRule>>,
    },
    RemoveRule {
        rule_id: String,
        reply: Reply<Vec<AlwaysAllowRule>>,
    },
    Stop {
        delete: bool,
        reply: Reply,
    },
    /// Sent by the actor's own linger timers
    ExpireTool {
        tool_use_id: String,
    },
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable address of a running session actor
#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    tx: mpsc::Sender<Command>,
    state: watch::Receiver<Session>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Latest published session record
    pub fn snapshot(&self) -> Session {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.state.borrow().status
    }

    /// Whether the actor still accepts commands
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Wait until the published record satisfies `pred`
    pub async fn wait_until(&self, pred: impl FnMut(&Session) -> bool) -> Session {
        let mut state = self.state.clone();
        let matched = state.wait_for(pred).await.map(|s| s.clone());
        match matched {
            Ok(session) => session,
            Err(_) => state.borrow().clone(),
        }
    }

    pub async fn send_prompt(&self, prompt: impl Into<String>) -> crate::Result<()> {
        let prompt = prompt.into();
        self.call(|reply| Command::SendPrompt { prompt, reply }).await
    }

    pub async fn respond_permission(
        &self,
        request_id: &str,
        approved: bool,
        reason: Option<String>,
        remember: bool,
    ) -> crate::Result<()> {
        let request_id = request_id.to_string();
        self.call(|reply| Command::RespondPermission {
            request_id,
            approved,
            reason,
            remember,
            reply,
        })
        .await
    }

    /// Abort the in-flight turn
    pub async fn interrupt(&self) -> crate::Result<()> {
        self.call(|reply| Command::Interrupt { reply }).await
    }

    pub async fn dismiss_tool(&self, tool_use_id: &str) -> crate::Result<()> {
        let tool_use_id = tool_use_id.to_string();
        self.call(|reply| Command::DismissTool { tool_use_id, reply })
            .await
    }

    /// Add an always-allow rule, returning the session's rules
    ///
    /// `permission_id` names a pending request the rule was created from;
    /// that request is approved as well.
    pub async fn add_always_allow_rule(
        &self,
        rule: AlwaysAllowRule,
        permission_id: Option<String>,
    ) -> crate::Result<Vec<AlwaysAllowRule>> {
        self.call(|reply| Command::AddRule {
            rule,
            permission_id,
            reply,
        })
        .await
    }

    /// Remove a rule by id, returning the remaining rules
    pub async fn remove_always_allow_rule(
        &self,
        rule_id: &str,
    ) -> crate::Result<Vec<AlwaysAllowRule>> {
        let rule_id = rule_id.to_string();
        self.call(|reply| Command::RemoveRule { rule_id, reply })
            .await
    }

    pub fn always_allow_rules(&self) -> Vec<AlwaysAllowRule> {
        self.state.borrow().options.always_allow_rules.clone()
    }

    /// Stop the agent and keep the record; the actor exits
    ///
    /// The actor stops even when the adapter fails to terminate; that
    /// failure is what the error reports.
    pub async fn end(&self) -> crate::Result<()> {
        self.call(|reply| Command::Stop {
            delete: false,
            reply,
        })
        .await
    }

    /// Stop the agent for deletion; the caller purges storage afterwards
    pub async fn delete(&self) -> crate::Result<()> {
        self.call(|reply| Command::Stop {
            delete: true,
            reply,
        })
        .await
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> crate::Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| crate::Error::SessionNotFound(self.id.clone()))?;
        rx.await
            .map_err(|_| crate::Error::SessionNotFound(self.id.clone()))?
    }
}

/// Spawn the actor for `session`, driving `adapter`
///
/// Returns at once; `session_created` is broadcast once the actor has
/// injected any resumed history and tried to start the agent.
pub fn spawn(
    session: Session,
    adapter: Box<dyn AgentAdapter>,
    ctx: ActorContext,
) -> SessionHandle {
    let (tx, mailbox) = mpsc::channel(ctx.settings.mailbox_capacity.max(1));
    let (state_tx, state) = watch::channel(session.clone());
    let handle = SessionHandle {
        id: session.id.clone(),
        tx: tx.clone(),
        state,
    };

    let actor = SessionActor {
        session,
        adapter,
        events: None,
        running: false,
        gate: PermissionGate::new(),
        tools: HashMap::new(),
        timers: HashMap::new(),
        streaming: None,
        awaiting_tool_result: false,
        deferred: VecDeque::new(),
        ctx,
        state_tx,
        self_tx: tx.downgrade(),
    };
    tokio::spawn(actor.run(mailbox));
    handle
}

// =============================================================================
// Actor
// =============================================================================

/// Assistant message being streamed to clients, logged once it closes
struct StreamingMessage {
    id: String,
    text: String,
    thinking: String,
    tools: Vec<ToolUse>,
    post_tool_result: bool,
}

impl StreamingMessage {
    fn new(post_tool_result: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: String::new(),
            thinking: String::new(),
            tools: Vec::new(),
            post_tool_result,
        }
    }

    fn is_empty(&self) -> bool {
        self.text.is_empty() && self.thinking.is_empty() && self.tools.is_empty()
    }
}

struct SessionActor {
    session: Session,
    adapter: Box<dyn AgentAdapter>,
    events: Option<AgentEventStream>,
    /// Adapter started and not since terminated
    running: bool,
    gate: PermissionGate,
    tools: HashMap<String, ActiveTool>,
    timers: HashMap<String, JoinHandle<()>>,
    streaming: Option<StreamingMessage>,
    /// Set by an approval; the next chunk opens a `post_tool_result` message
    awaiting_tool_result: bool,
    /// Agent output that arrived while a tool waited for a human
    deferred: VecDeque<AgentEvent>,
    ctx: ActorContext,
    state_tx: watch::Sender<Session>,
    self_tx: mpsc::WeakSender<Command>,
}

impl SessionActor {
    async fn run(mut self, mut mailbox: mpsc::Receiver<Command>) {
        self.startup().await;

        loop {
            // Output held back during an approval is replayed once it resolves
            if self.gate.pending().is_none() {
                if let Some(event) = self.deferred.pop_front() {
                    self.handle_event(event).await;
                    continue;
                }
            }
            let paused = self.gate.pending().is_some();
            let deadline = self.gate.deadline();

            tokio::select! {
                command = mailbox.recv() => {
                    let Some(command) = command else {
                        tracing::debug!(session_id = %self.session.id, "All handles dropped");
                        let _ = self.teardown(false).await;
                        break;
                    };
                    if self.handle_command(command).await.is_break() {
                        break;
                    }
                }
                event = next_event(&mut self.events) => match event {
                    Some(event) if paused => self.on_event_while_paused(event).await,
                    Some(event) => self.handle_event(event).await,
                    None => self.on_stream_closed().await,
                },
                _ = sleep_until(deadline), if deadline.is_some() => {
                    self.on_approval_timeout().await;
                }
            }
        }

        tracing::debug!(session_id = %self.session.id, "Session actor stopped");
    }

    async fn startup(&mut self) {
        let id = self.session.id.clone();

        for rule in &mut self.session.options.always_allow_rules {
            if rule.id.is_empty() {
                rule.id = uuid::Uuid::new_v4().to_string();
            }
            if rule.description.is_empty() {
                rule.description = rule.describe();
            }
        }

        // Resumed history leads the log, ahead of any new activity
        if self.ctx.storage.messages.count(&id).await == 0 {
            let history = self.session.options.conversation_history.clone();
            for entry in &history {
                let message = NewMessage::new(entry.role, MessageContent::from_history(entry));
                self.ctx.storage.messages.append(&id, message).await;
            }
            if !history.is_empty() {
                tracing::info!(
                    session_id = %id,
                    original_session_id = ?self.session.options.original_session_id,
                    "Injected {} history messages",
                    history.len()
                );
            }
        }

        self.refresh_git_branch().await;
        self.publish(false).await;
        self.ctx.events.send(ServerEvent::SessionCreated {
            session_id: id,
            session: self.session.clone(),
        });

        if let Err(e) = self.start_adapter().await {
            self.report_failure(e.to_string()).await;
        }
    }

    async fn start_adapter(&mut self) -> crate::Result<()> {
        let resume = self.session.engine_session_id.clone();
        self.adapter
            .start(&self.session.options, resume.as_deref())
            .await?;
        self.events = self.adapter.events();
        self.running = true;

        tracing::info!(
            session_id = %self.session.id,
            engine = self.adapter.name(),
            resumed = resume.is_some(),
            "Agent started"
        );
        Ok(())
    }

    // =========================================================================
    // Commands
    // =========================================================================

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::SendPrompt { prompt, reply } => {
                let result = self.send_prompt(prompt).await;
                let _ = reply.send(result);
            }
            Command::RespondPermission {
                request_id,
                approved,
                reason,
                remember,
                reply,
            } => {
                let result = self
                    .respond_permission(&request_id, approved, reason, remember)
                    .await;
                let _ = reply.send(result);
            }
            Command::Interrupt { reply } => {
                self.interrupt().await;
                let _ = reply.send(Ok(()));
            }
            Command::DismissTool { tool_use_id, reply } => {
                self.remove_tool(&tool_use_id);
                let _ = reply.send(Ok(()));
            }
            Command::ExpireTool { tool_use_id } => {
                self.timers.remove(&tool_use_id);
                let finished = self
                    .tools
                    .get(&tool_use_id)
                    .is_some_and(|t| t.status != ToolStatus::Running);
                if finished {
                    self.remove_tool(&tool_use_id);
                }
            }
            Command::AddRule {
                rule,
                permission_id,
                reply,
            } => {
                let result = self.add_rule(rule, permission_id).await;
                let _ = reply.send(result);
            }
            Command::RemoveRule { rule_id, reply } => {
                let result = self.remove_rule(&rule_id).await;
                let _ = reply.send(result);
            }
            Command::Stop { delete, reply } => {
                let result = self.teardown(delete).await;
                let _ = reply.send(result);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn send_prompt(&mut self, prompt: String) -> crate::Result<()> {
        if self.session.status.is_busy() {
            return Err(crate::Error::SessionBusy(self.session.id.clone()));
        }

        if !self.running {
            if let Err(e) = self.start_adapter().await {
                self.report_failure(e.to_string()).await;
                return Err(e);
            }
        }

        self.ctx
            .storage
            .messages
            .append(
                &self.session.id,
                NewMessage::new(Role::User, MessageContent::user(prompt.clone())),
            )
            .await;
        self.session.status = SessionStatus::Processing;
        self.session.error_message = None;
        self.publish(true).await;

        if let Err(e) = self.adapter.send(&prompt).await {
            self.fail(e.to_string()).await;
            return Err(e);
        }
        Ok(())
    }

    async fn respond_permission(
        &mut self,
        request_id: &str,
        approved: bool,
        reason: Option<String>,
        remember: bool,
    ) -> crate::Result<()> {
        let resolution = self.gate.resolve(request_id, approved, reason, remember)?;
        tracing::info!(
            session_id = %self.session.id,
            tool = %resolution.request.tool,
            approved,
            remember,
            "Permission decided"
        );
        self.apply_resolution(resolution).await;
        Ok(())
    }

    async fn on_approval_timeout(&mut self) {
        if let Some(resolution) = self.gate.force_deny(DENIED_ON_TIMEOUT) {
            tracing::warn!(
                session_id = %self.session.id,
                tool = %resolution.request.tool,
                "Permission request timed out"
            );
            self.apply_resolution(resolution).await;
        }
    }

    async fn apply_resolution(&mut self, resolution: Resolution) {
        let Resolution {
            request,
            decision,
            remember,
        } = resolution;
        if let Err(e) = self
            .adapter
            .authorize(&request.tool_use_id, &decision)
            .await
        {
            self.fail(format!("Failed to deliver permission decision: {}", e))
                .await;
            return;
        }

        self.record_decision(&request, &decision).await;
        if remember {
            self.remember_tool(&request.tool);
        }
        if decision.is_allow() {
            self.awaiting_tool_result = true;
        } else {
            self.finish_tool(&request.tool_use_id, ToolStatus::Error);
        }
        self.session.status = SessionStatus::Processing;
        self.publish(true).await;
    }

    /// Log the decision and acknowledge it to every client
    async fn record_decision(&mut self, request: &PermissionRequest, decision: &ToolDecision) {
        let status = match decision {
            ToolDecision::Allow => format!("Permission approved for {}", request.tool),
            ToolDecision::Deny { reason } => {
                format!("Permission denied for {}: {}", request.tool, reason)
            }
        };

        self.ctx
            .storage
            .messages
            .append(
                &self.session.id,
                NewMessage::new(
                    Role::System,
                    MessageContent::system("permission_decision", Some(status.clone())),
                ),
            )
            .await;
        self.ctx.events.send(ServerEvent::PermissionAcknowledged {
            session_id: self.session.id.clone(),
            request_id: request.request_id.clone(),
            approved: decision.is_allow(),
            status,
        });
    }

    /// Approve later calls of `tool` without asking
    fn remember_tool(&mut self, tool: &str) {
        let mut rule = AlwaysAllowRule::allow_all(tool);
        let rules = &mut self.session.options.always_allow_rules;
        let known = rules
            .iter()
            .any(|r| r.tool == rule.tool && r.match_mode == rule.match_mode && r.pattern == rule.pattern);
        if !known {
            rule.id = uuid::Uuid::new_v4().to_string();
            rule.created_at = Some(chrono::Utc::now());
            tracing::info!(session_id = %self.session.id, tool = %tool, "Tool always allowed");
            rules.push(rule);
        }
    }

    async fn add_rule(
        &mut self,
        mut rule: AlwaysAllowRule,
        permission_id: Option<String>,
    ) -> crate::Result<Vec<AlwaysAllowRule>> {
        rule.validate()?;
        if rule.id.is_empty() {
            rule.id = uuid::Uuid::new_v4().to_string();
        }
        if rule.description.is_empty() {
            rule.description = rule.describe();
        }
        rule.created_at = Some(chrono::Utc::now());
        tracing::info!(
            session_id = %self.session.id,
            rule_id = %rule.id,
            tool = %rule.tool,
            "Always-allow rule added: {}",
            rule.description
        );
        self.session.options.always_allow_rules.push(rule);

        let pending = self.gate.pending().map(|p| p.request_id.clone());
        match permission_id {
            Some(id) if pending.as_deref() == Some(id.as_str()) => {
                let resolution = self.gate.resolve(&id, true, None, false)?;
                self.apply_resolution(resolution).await;
            }
            Some(id) => {
                tracing::warn!(session_id = %self.session.id, request_id = %id, "No pending permission to approve");
                self.publish(true).await;
            }
            None => self.publish(true).await,
        }
        Ok(self.session.options.always_allow_rules.clone())
    }

    async fn remove_rule(&mut self, rule_id: &str) -> crate::Result<Vec<AlwaysAllowRule>> {
        let rules = &mut self.session.options.always_allow_rules;
        let before = rules.len();
        rules.retain(|r| r.id != rule_id);
        if rules.len() != before {
            tracing::info!(session_id = %self.session.id, rule_id = %rule_id, "Always-allow rule removed");
            self.publish(true).await;
        }
        Ok(self.session.options.always_allow_rules.clone())
    }

    async fn interrupt(&mut self) {
        if !self.session.status.is_busy() {
            return;
        }

        if let Some(resolution) = self.gate.force_deny(DENIED_ON_INTERRUPT) {
            if let Err(e) = self
                .adapter
                .authorize(&resolution.request.tool_use_id, &resolution.decision)
                .await
            {
                tracing::debug!(session_id = %self.session.id, "Deny on interrupt failed: {}", e);
            }
            self.record_decision(&resolution.request, &resolution.decision)
                .await;
        }
        if let Err(e) = self.adapter.interrupt().await {
            tracing::warn!(session_id = %self.session.id, "Failed to interrupt agent: {}", e);
        }

        self.deferred.clear();
        self.close_streaming().await;
        self.clear_turn_state();
        self.session.status = SessionStatus::Idle;
        self.publish(true).await;
        self.ctx.events.send(ServerEvent::SessionInterrupted {
            session_id: self.session.id.clone(),
        });
        tracing::info!(session_id = %self.session.id, "Turn interrupted");
    }

    /// Stop the agent; the actor exits after this
    async fn teardown(&mut self, delete: bool) -> crate::Result<()> {
        if let Some(resolution) = self.gate.force_deny(DENIED_ON_TEARDOWN) {
            if !delete {
                self.record_decision(&resolution.request, &resolution.decision)
                    .await;
            }
        }
        self.deferred.clear();
        if delete {
            self.streaming = None;
        } else {
            self.close_streaming().await;
        }
        self.clear_turn_state();

        let result = self.adapter.terminate().await;
        if let Err(e) = &result {
            tracing::warn!(session_id = %self.session.id, "Agent did not stop cleanly: {}", e);
        }
        self.running = false;
        self.events = None;

        if delete {
            self.session.status = SessionStatus::Deleted;
            self.session.touch();
            self.state_tx.send_replace(self.session.clone());
        } else {
            self.session.status = SessionStatus::Ended;
            self.publish(false).await;
            self.ctx.events.send(ServerEvent::SessionEnded {
                session_id: self.session.id.clone(),
            });
        }
        tracing::info!(session_id = %self.session.id, delete, "Session stopped");
        result
    }

    // =========================================================================
    // Agent events
    // =========================================================================

    /// Only a dying engine is acted on while a tool waits for a human
    async fn on_event_while_paused(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::Fatal(message) => self.fail(message).await,
            event => self.deferred.push_back(event),
        }
    }

    async fn handle_event(&mut self, event: AgentEvent) {
        // Late output of an interrupted turn
        let outside_turn = !self.session.status.is_busy()
            && !matches!(event, AgentEvent::EngineSession(_) | AgentEvent::Fatal(_));
        if outside_turn {
            self.discard_stray(event).await;
            return;
        }

        match event {
            AgentEvent::Thinking(thinking) => {
                self.ctx.events.send(ServerEvent::AgentThinking {
                    session_id: self.session.id.clone(),
                    thinking,
                });
            }
            AgentEvent::ThinkingText(text) => {
                self.streaming_message().thinking.push_str(&text);
            }
            AgentEvent::ContentChunk {
                role: Role::Assistant,
                text,
            } => self.stream_chunk(text),
            AgentEvent::ContentChunk { role, text } => {
                self.close_streaming().await;
                let content = match role {
                    Role::User => MessageContent::user(text),
                    _ => MessageContent::system("agent", Some(text)),
                };
                self.append_and_broadcast(role, content).await;
            }
            AgentEvent::ToolUse { id, name, input } => self.tool_started(id, name, input),
            AgentEvent::ToolApproval { id, name, input } => {
                self.tool_approval(id, name, input).await
            }
            AgentEvent::ToolResult {
                id,
                content,
                is_error,
            } => self.tool_finished(id, content, is_error).await,
            AgentEvent::TurnComplete(stats) => self.turn_complete(stats).await,
            AgentEvent::EngineSession(engine_id) => {
                if self.session.engine_session_id.as_deref() != Some(engine_id.as_str()) {
                    tracing::debug!(session_id = %self.session.id, engine_session_id = %engine_id, "Engine session assigned");
                    self.session.engine_session_id = Some(engine_id);
                    self.publish(false).await;
                }
            }
            AgentEvent::Fatal(message) => self.fail(message).await,
        }
    }

    async fn discard_stray(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::ToolApproval { id, name, .. } => {
                tracing::debug!(session_id = %self.session.id, tool = %name, "Denying tool outside a turn");
                let decision = ToolDecision::Deny {
                    reason: DENIED_OUTSIDE_TURN.to_string(),
                };
                if let Err(e) = self.adapter.authorize(&id, &decision).await {
                    tracing::debug!(session_id = %self.session.id, "Stray denial failed: {}", e);
                }
            }
            other => {
                tracing::debug!(session_id = %self.session.id, event = ?other, "Dropping output outside a turn");
            }
        }
    }

    async fn on_stream_closed(&mut self) {
        self.events = None;
        if !self.running {
            return;
        }
        if self.session.status.is_busy() {
            self.fail("Agent process exited unexpectedly".to_string())
                .await;
        } else {
            tracing::debug!(session_id = %self.session.id, "Agent event stream closed while idle");
            self.running = false;
        }
    }

    fn streaming_message(&mut self) -> &mut StreamingMessage {
        if self.streaming.is_none() {
            let post_tool_result = std::mem::take(&mut self.awaiting_tool_result);
            self.streaming = Some(StreamingMessage::new(post_tool_result));
        }
        self.streaming
            .get_or_insert_with(|| StreamingMessage::new(false))
    }

    fn stream_chunk(&mut self, text: String) {
        let session_id = self.session.id.clone();
        let git_branch = self.session.git_branch.clone();
        let message = self.streaming_message();
        message.text.push_str(&text);

        let event = ServerEvent::AgentMessage {
            session_id,
            message_id: message.id.clone(),
            role: Role::Assistant,
            content: MessageContent::assistant(text),
            metadata: MessageMetadata {
                sequence: None,
                git_branch,
                post_tool_result: message.post_tool_result,
            },
        };
        self.ctx.events.send(event);
    }

    /// Append the streamed assistant message to the log
    async fn close_streaming(&mut self) {
        let Some(message) = self.streaming.take() else {
            return;
        };
        if message.is_empty() {
            return;
        }

        let tool_uses = (!message.tools.is_empty()).then(|| message.tools.clone());
        let thinking_content = (!message.thinking.is_empty()).then_some(message.thinking);
        let entry = NewMessage {
            role: Role::Assistant,
            content: MessageContent::Assistant {
                text: message.text,
                tools: message.tools,
                tool_results: Vec::new(),
            },
            tool_uses,
            thinking_content,
        };
        self.ctx
            .storage
            .messages
            .append(&self.session.id, entry)
            .await;
    }

    async fn append_and_broadcast(&mut self, role: Role, content: MessageContent) {
        let message = self
            .ctx
            .storage
            .messages
            .append(&self.session.id, NewMessage::new(role, content))
            .await;
        self.ctx.events.send(ServerEvent::AgentMessage {
            session_id: self.session.id.clone(),
            message_id: uuid::Uuid::new_v4().to_string(),
            role,
            content: message.content,
            metadata: MessageMetadata {
                sequence: Some(message.sequence),
                git_branch: self.session.git_branch.clone(),
                post_tool_result: false,
            },
        });
    }

    fn tool_started(&mut self, id: String, name: String, input: serde_json::Value) {
        self.streaming_message().tools.push(ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: input.clone(),
        });
        self.tools.insert(
            id.clone(),
            ActiveTool {
                id: id.clone(),
                session_id: self.session.id.clone(),
                name: name.clone(),
                input: input.clone(),
                status: ToolStatus::Running,
                start_time: chrono::Utc::now(),
                end_time: None,
            },
        );
        self.ctx.events.send(ServerEvent::AgentToolUse {
            session_id: self.session.id.clone(),
            tool_use_id: id,
            tool: name,
            parameters: input,
        });
    }

    async fn tool_approval(&mut self, id: String, name: String, input: serde_json::Value) {
        let mode = self.session.options.permission_mode;
        let rule = rules::find_match(&self.session.options.always_allow_rules, &name, &input);
        if let Some(rule) = rule {
            tracing::debug!(session_id = %self.session.id, tool = %name, rule = %rule.description, "Tool allowed by rule");
        }
        if rule.is_some() || !self.ctx.settings.policy.requires_approval(&name, mode) {
            tracing::debug!(session_id = %self.session.id, tool = %name, "Tool auto-approved");
            if let Err(e) = self.adapter.authorize(&id, &ToolDecision::Allow).await {
                self.fail(format!("Failed to authorize {}: {}", name, e))
                    .await;
            }
            return;
        }

        if !self.tools.contains_key(&id) {
            self.tool_started(id.clone(), name.clone(), input.clone());
        }

        match self.gate.request(
            &self.session.id,
            &id,
            &name,
            &input,
            self.ctx.settings.approval_timeout,
        ) {
            Ok(request) => {
                self.close_streaming().await;
                self.session.status = SessionStatus::AwaitingPermission;
                self.ctx
                    .events
                    .send(ServerEvent::permission_request(&request));
                self.publish(true).await;
                tracing::info!(
                    session_id = %self.session.id,
                    request_id = %request.request_id,
                    tool = %name,
                    "Awaiting permission"
                );
            }
            Err(e) => {
                tracing::warn!(session_id = %self.session.id, "Denying {}: {}", name, e);
                let decision = ToolDecision::Deny {
                    reason: e.to_string(),
                };
                if let Err(e) = self.adapter.authorize(&id, &decision).await {
                    self.fail(format!("Failed to deny {}: {}", name, e)).await;
                }
            }
        }
    }

    async fn tool_finished(&mut self, id: String, content: String, is_error: bool) {
        self.close_streaming().await;
        let status = if is_error {
            ToolStatus::Error
        } else {
            ToolStatus::Completed
        };
        self.finish_tool(&id, status);

        let result = ToolResult {
            tool_use_id: id,
            content,
            is_error,
        };
        self.append_and_broadcast(
            Role::User,
            MessageContent::User {
                text: String::new(),
                tool_results: vec![result],
            },
        )
        .await;
    }

    async fn turn_complete(&mut self, stats: TurnStats) {
        self.close_streaming().await;
        self.clear_turn_state();

        self.ctx
            .storage
            .messages
            .append(
                &self.session.id,
                NewMessage::new(Role::System, MessageContent::result(&stats)),
            )
            .await;
        self.session.record_turn(&stats);
        self.session.status = SessionStatus::Idle;
        self.refresh_git_branch().await;
        self.publish(true).await;

        tracing::info!(
            session_id = %self.session.id,
            cost_usd = stats.cost_usd,
            num_turns = stats.num_turns,
            duration_ms = stats.duration_ms,
            "Turn complete"
        );
    }

    /// Runtime failure: stop the agent, keep the actor addressable
    async fn fail(&mut self, message: String) {
        tracing::error!(session_id = %self.session.id, "Agent failed: {}", message);
        if let Some(resolution) = self.gate.force_deny(DENIED_ON_FAILURE) {
            self.record_decision(&resolution.request, &resolution.decision)
                .await;
        }
        self.deferred.clear();
        self.close_streaming().await;
        self.clear_turn_state();

        if let Err(e) = self.adapter.terminate().await {
            tracing::warn!(session_id = %self.session.id, "Failed to stop agent: {}", e);
        }
        self.running = false;
        self.events = None;
        self.report_failure(message).await;
    }

    async fn report_failure(&mut self, message: String) {
        self.session.status = SessionStatus::Error;
        self.session.error_message = Some(message.clone());
        self.ctx.events.send(ServerEvent::Error {
            session_id: Some(self.session.id.clone()),
            message,
        });
        self.publish(true).await;
    }

    // =========================================================================
    // Tool bookkeeping
    // =========================================================================

    fn finish_tool(&mut self, tool_use_id: &str, status: ToolStatus) {
        let Some(tool) = self.tools.get_mut(tool_use_id) else {
            return;
        };
        if tool.status == ToolStatus::Running {
            tool.status = status;
            tool.end_time = Some(chrono::Utc::now());
        }
        self.schedule_expiry(tool_use_id);
    }

    fn schedule_expiry(&mut self, tool_use_id: &str) {
        let weak = self.self_tx.clone();
        let linger = self.ctx.settings.tool_linger;
        let id = tool_use_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(Command::ExpireTool { tool_use_id: id }).await;
            }
        });
        if let Some(previous) = self.timers.insert(tool_use_id.to_string(), timer) {
            previous.abort();
        }
    }

    fn remove_tool(&mut self, tool_use_id: &str) {
        if let Some(timer) = self.timers.remove(tool_use_id) {
            timer.abort();
        }
        if self.tools.remove(tool_use_id).is_some() {
            self.ctx.events.send(ServerEvent::ToolDismissed {
                session_id: self.session.id.clone(),
                tool_use_id: tool_use_id.to_string(),
            });
        }
    }

    /// Forget tools, timers and any pending approval of the current turn
    fn clear_turn_state(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        self.tools.clear();
        self.gate.force_deny(DENIED_ON_TEARDOWN);
        self.awaiting_tool_result = false;
    }

    // =========================================================================
    // Publishing
    // =========================================================================

    async fn refresh_git_branch(&mut self) {
        let dir = match &self.session.options.working_directory {
            Some(dir) => dir.clone(),
            None => match std::env::current_dir() {
                Ok(dir) => dir,
                Err(_) => return,
            },
        };
        let branch = crate::git::current_branch(&dir).await;
        if branch != self.session.git_branch {
            tracing::debug!(session_id = %self.session.id, branch = ?branch, "Git branch changed");
            self.session.git_branch = branch;
        }
    }

    /// Persist and publish the record, optionally announcing `session_updated`
    async fn publish(&mut self, announce: bool) {
        self.session.touch();
        self.ctx.storage.sessions.save(&self.session).await;
        self.state_tx.send_replace(self.session.clone());
        if announce {
            self.ctx.events.send(ServerEvent::SessionUpdated {
                session_id: self.session.id.clone(),
                session: self.session.clone(),
            });
        }
    }
}

async fn next_event(events: &mut Option<AgentEventStream>) -> Option<AgentEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
