//! Claude Code CLI adapter
//!
//! Spawns `claude` in stream-json mode with `--permission-prompt-tool stdio`,
//! so every tool the CLI wants to run arrives as a `can_use_tool` control
//! request and waits for our control response. stdout is decoded line by line
//! into [`AgentEvent`]s by a reader task.

use super::adapter::{
    check_working_directory, AdapterFactory, AgentAdapter, AgentEvent, AgentEventStream,
    ToolDecision, EVENT_CHANNEL_CAPACITY,
};
use super::types::*;
use crate::config::AgentConfig;
use crate::session::types::{PromptSource, Role, SessionOptions, TurnStats, Usage};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};

const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Builds [`ClaudeCliAdapter`]s from agent configuration
pub struct ClaudeCliFactory {
    binary: Option<PathBuf>,
    default_model: Option<String>,
}

impl ClaudeCliFactory {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            default_model: config.default_model.clone(),
        }
    }
}

impl AdapterFactory for ClaudeCliFactory {
    fn create(&self, session_id: &str) -> Box<dyn AgentAdapter> {
        Box::new(ClaudeCliAdapter::new(
            session_id,
            self.binary.clone(),
            self.default_model.clone(),
        ))
    }
}

/// A `can_use_tool` request waiting for our answer
struct PendingApproval {
    request_id: String,
    input: serde_json::Value,
}

type ApprovalMap = Arc<Mutex<HashMap<String, PendingApproval>>>;

/// One Claude Code CLI process per session
pub struct ClaudeCliAdapter {
    session_id: String,
    binary: Option<PathBuf>,
    default_model: Option<String>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    events: Option<AgentEventStream>,
    event_tx: Option<mpsc::Sender<AgentEvent>>,
    approvals: ApprovalMap,
    thinking: Arc<AtomicBool>,
    /// Set when we stop the current run, so its reader stays quiet on EOF
    stopping: Arc<AtomicBool>,
}

impl ClaudeCliAdapter {
    pub fn new(
        session_id: impl Into<String>,
        binary: Option<PathBuf>,
        default_model: Option<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            binary,
            default_model,
            child: None,
            stdin: None,
            events: None,
            event_tx: None,
            approvals: Arc::new(Mutex::new(HashMap::new())),
            thinking: Arc::new(AtomicBool::new(false)),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn write_line(&mut self, message: &serde_json::Value) -> crate::Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            crate::Error::Adapter("Claude Code CLI is not running".to_string())
        })?;
        let mut line = message.to_string();
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| crate::Error::Adapter(format!("Failed to write to CLI stdin: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| crate::Error::Adapter(format!("Failed to flush CLI stdin: {}", e)))
    }
}

#[async_trait]
impl AgentAdapter for ClaudeCliAdapter {
    fn name(&self) -> &'static str {
        "claude"
    }

    async fn start(&mut self, options: &SessionOptions, resume: Option<&str>) -> crate::Result<()> {
        check_working_directory(options).await?;
        if self.child.is_some() {
            self.terminate().await?;
        }

        let binary = match &self.binary {
            Some(binary) => binary.clone(),
            None => resolve_claude_binary().await?,
        };
        let system_prompt = resolve_system_prompt(options).await?;
        let args = build_args(
            options,
            system_prompt.as_deref(),
            resume,
            self.default_model.as_deref(),
        );

        tracing::info!(
            session_id = %self.session_id,
            binary = %binary.display(),
            resume = ?resume,
            "Spawning Claude Code CLI"
        );

        let mut cmd = Command::new(&binary);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &options.working_directory {
            cmd.current_dir(dir);
        }
        if let Some(key) = &options.api_key {
            cmd.env("ANTHROPIC_API_KEY", key);
        }
        if let Some(url) = &options.base_url {
            cmd.env("ANTHROPIC_BASE_URL", url);
        }
        if let Some(max_tokens) = options.max_tokens {
            cmd.env("CLAUDE_CODE_MAX_OUTPUT_TOKENS", max_tokens.to_string());
        }

        let mut child = cmd.spawn().map_err(|e| {
            crate::Error::Startup(format!(
                "Failed to spawn Claude Code CLI at {}: {}",
                binary.display(),
                e
            ))
        })?;
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(crate::Error::Startup(
                "Claude Code CLI stdio unavailable".to_string(),
            ));
        };

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let stopping = Arc::new(AtomicBool::new(false));
        self.thinking.store(false, Ordering::SeqCst);
        self.approvals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();

        let translator = Translator {
            approvals: Arc::clone(&self.approvals),
            thinking: Arc::clone(&self.thinking),
        };
        tokio::spawn(read_stdout(
            self.session_id.clone(),
            stdout,
            tx.clone(),
            translator,
            Arc::clone(&stopping),
        ));
        tokio::spawn(log_stderr(self.session_id.clone(), stderr));

        self.child = Some(child);
        self.stdin = Some(stdin);
        self.events = Some(rx);
        self.event_tx = Some(tx);
        self.stopping = stopping;
        Ok(())
    }

    fn events(&mut self) -> Option<AgentEventStream> {
        self.events.take()
    }

    async fn send(&mut self, prompt: &str) -> crate::Result<()> {
        if !self.thinking.swap(true, Ordering::SeqCst) {
            if let Some(tx) = &self.event_tx {
                // Never await here: the actor is the consumer of this channel
                let _ = tx.try_send(AgentEvent::Thinking(true));
            }
        }
        self.write_line(&user_message_to_cli_ndjson(prompt)).await
    }

    async fn authorize(&mut self, tool_use_id: &str, decision: &ToolDecision) -> crate::Result<()> {
        let pending = self
            .approvals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(tool_use_id)
            .ok_or_else(|| {
                crate::Error::Adapter(format!("No pending approval for tool {}", tool_use_id))
            })?;

        let response = match decision {
            ToolDecision::Allow => permission_allow_to_cli_ndjson(&pending.request_id, &pending.input),
            ToolDecision::Deny { reason } => permission_deny_to_cli_ndjson(&pending.request_id, reason),
        };
        self.write_line(&response).await
    }

    async fn interrupt(&mut self) -> crate::Result<()> {
        self.thinking.store(false, Ordering::SeqCst);
        self.approvals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.write_line(&interrupt_to_cli_ndjson()).await
    }

    async fn terminate(&mut self) -> crate::Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        self.stopping.store(true, Ordering::SeqCst);
        self.stdin = None;
        self.event_tx = None;

        tracing::info!(session_id = %self.session_id, "Killing CLI process");
        let _ = child.start_kill();
        let result = tokio::time::timeout(KILL_GRACE, child.wait()).await;
        if result.is_err() {
            tracing::warn!(session_id = %self.session_id, "Force killing CLI process");
            child
                .kill()
                .await
                .map_err(|e| crate::Error::Adapter(format!("Failed to kill CLI process: {}", e)))?;
        }
        Ok(())
    }
}

// =============================================================================
// Output decoding
// =============================================================================

/// Maps CLI messages to adapter events
struct Translator {
    approvals: ApprovalMap,
    thinking: Arc<AtomicBool>,
}

impl Translator {
    fn translate(&self, message: CliMessage) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        match message {
            CliMessage::System(sys) => {
                if sys.subtype == "init" {
                    if let Some(id) = sys.session_id {
                        events.push(AgentEvent::EngineSession(id));
                    }
                }
            }
            CliMessage::Assistant(msg) => {
                self.stop_thinking(&mut events);
                for block in msg.message.content {
                    match block {
                        ContentBlock::Text { text } => events.push(AgentEvent::ContentChunk {
                            role: Role::Assistant,
                            text,
                        }),
                        ContentBlock::Thinking { thinking } => {
                            events.push(AgentEvent::ThinkingText(thinking))
                        }
                        ContentBlock::ToolUse { id, name, input } => {
                            events.push(AgentEvent::ToolUse { id, name, input })
                        }
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } => events.push(AgentEvent::ToolResult {
                            id: tool_use_id,
                            content: tool_result_text(&content),
                            is_error,
                        }),
                        ContentBlock::Unknown => {}
                    }
                }
            }
            CliMessage::User(msg) => {
                if let UserContent::Blocks(blocks) = msg.message.content {
                    for block in blocks {
                        if let ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } = block
                        {
                            events.push(AgentEvent::ToolResult {
                                id: tool_use_id,
                                content: tool_result_text(&content),
                                is_error,
                            });
                        }
                    }
                }
            }
            CliMessage::Result(result) => {
                self.stop_thinking(&mut events);
                let usage = result.usage.unwrap_or_default();
                events.push(AgentEvent::TurnComplete(TurnStats {
                    cost_usd: result.total_cost_usd.unwrap_or(0.0),
                    num_turns: result.num_turns.unwrap_or(1),
                    duration_ms: result.duration_ms.unwrap_or(0),
                    usage: Usage {
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                        cache_creation_input_tokens: usage.cache_creation_input_tokens,
                        cache_read_input_tokens: usage.cache_read_input_tokens,
                    },
                    is_error: result.is_error,
                }));
            }
            CliMessage::ControlRequest(req) if req.request.subtype == "can_use_tool" => {
                let name = req.request.tool_name.unwrap_or_else(|| "unknown".to_string());
                let input = req.request.input.unwrap_or(serde_json::Value::Null);
                let id = req
                    .request
                    .tool_use_id
                    .unwrap_or_else(|| req.request_id.clone());
                self.approvals
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(
                        id.clone(),
                        PendingApproval {
                            request_id: req.request_id,
                            input: input.clone(),
                        },
                    );
                events.push(AgentEvent::ToolApproval { id, name, input });
            }
            CliMessage::ControlRequest(req) => {
                tracing::debug!(subtype = %req.request.subtype, "Ignoring CLI control request");
            }
            CliMessage::StreamEvent(_) | CliMessage::ControlResponse(_) | CliMessage::KeepAlive => {}
        }
        events
    }

    fn stop_thinking(&self, events: &mut Vec<AgentEvent>) {
        if self.thinking.swap(false, Ordering::SeqCst) {
            events.push(AgentEvent::Thinking(false));
        }
    }
}

async fn read_stdout(
    session_id: String,
    stdout: ChildStdout,
    tx: mpsc::Sender<AgentEvent>,
    translator: Translator,
    stopping: Arc<AtomicBool>,
) {
    let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(tokio_util::codec::LinesCodecError::MaxLineLengthExceeded) => {
                tracing::warn!(session_id = %session_id, "Dropping oversized CLI output line");
                continue;
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, "Failed to read CLI output: {}", e);
                break;
            }
        };
        let Some(message) = parse_cli_line(&line) else {
            continue;
        };
        for event in translator.translate(message) {
            if tx.send(event).await.is_err() {
                return;
            }
        }
    }

    if !stopping.load(Ordering::SeqCst) {
        tracing::warn!(session_id = %session_id, "Claude Code CLI exited unexpectedly");
        let _ = tx
            .send(AgentEvent::Fatal(
                "Claude Code CLI exited unexpectedly".to_string(),
            ))
            .await;
    }
}

async fn log_stderr(session_id: String, stderr: ChildStderr) {
    let mut lines = FramedRead::new(stderr, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    while let Some(Ok(line)) = lines.next().await {
        tracing::debug!(session_id = %session_id, "[claude stderr] {}", line);
    }
}

// =============================================================================
// Launch parameters
// =============================================================================

/// Command-line arguments for one CLI run
fn build_args(
    options: &SessionOptions,
    system_prompt: Option<&str>,
    resume: Option<&str>,
    default_model: Option<&str>,
) -> Vec<String> {
    let mut args: Vec<String> = [
        "--print",
        "--output-format",
        "stream-json",
        "--input-format",
        "stream-json",
        "--verbose",
        "--permission-prompt-tool",
        "stdio",
        "--permission-mode",
        options.permission_mode.as_cli_flag(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if let Some(model) = options.model.as_deref().or(default_model) {
        args.push("--model".to_string());
        args.push(model.to_string());
    }
    if let Some(prompt) = system_prompt {
        args.push("--system-prompt".to_string());
        args.push(prompt.to_string());
    }
    if !options.tools.is_empty() {
        args.push("--allowedTools".to_string());
        args.push(options.tools.join(","));
    }
    match resume {
        Some(engine_session) => {
            args.push("--resume".to_string());
            args.push(engine_session.to_string());
        }
        // A resumed engine already carries the history
        None => {
            if let Some(history) = format_history(options) {
                args.push("--append-system-prompt".to_string());
                args.push(history);
            }
        }
    }
    args
}

/// Render supplied conversation history as priming text
fn format_history(options: &SessionOptions) -> Option<String> {
    if options.conversation_history.is_empty() {
        return None;
    }
    let mut text = match &options.original_session_id {
        Some(original) => format!(
            "This conversation resumes session {}. The earlier exchange was:\n",
            original
        ),
        None => "This conversation resumes an earlier one. The earlier exchange was:\n".to_string(),
    };
    for entry in &options.conversation_history {
        let speaker = match entry.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => "System",
        };
        text.push_str(&format!("\n{}: {}\n", speaker, entry.content));
    }
    text.push_str("\nContinue from where it left off.");
    Some(text)
}

/// System prompt text for the session's prompt source
async fn resolve_system_prompt(options: &SessionOptions) -> crate::Result<Option<String>> {
    match options.prompt_source() {
        PromptSource::SystemPrompt(prompt) => Ok(Some(prompt.to_string())),
        PromptSource::Agent(name) => load_agent_profile(name, options.working_directory.as_deref())
            .await
            .map(Some),
        PromptSource::EngineDefault => Ok(None),
    }
}

/// Load `<name>.md` from the project's or the user's `.claude/agents` directory
async fn load_agent_profile(name: &str, working_dir: Option<&Path>) -> crate::Result<String> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(crate::Error::Startup(format!("Invalid agent name: {}", name)));
    }

    let file = format!("{}.md", name);
    let mut candidates = Vec::new();
    if let Some(dir) = working_dir {
        candidates.push(dir.join(".claude").join("agents").join(&file));
    }
    if let Some(home) = dirs_next::home_dir() {
        candidates.push(home.join(".claude").join("agents").join(&file));
    }

    for candidate in &candidates {
        if let Ok(content) = tokio::fs::read_to_string(candidate).await {
            tracing::debug!(agent = name, path = %candidate.display(), "Loaded agent profile");
            return Ok(strip_frontmatter(&content).to_string());
        }
    }
    Err(crate::Error::Startup(format!("Agent profile not found: {}", name)))
}

/// Drop a leading `---` YAML block
fn strip_frontmatter(content: &str) -> &str {
    let Some(rest) = content.strip_prefix("---") else {
        return content.trim();
    };
    match rest.find("\n---") {
        Some(end) => {
            let body = &rest[end + 4..];
            body.trim()
        }
        None => content.trim(),
    }
}

/// Resolve the Claude Code CLI binary path
async fn resolve_claude_binary() -> crate::Result<PathBuf> {
    // Check PATH via `which`
    if let Ok(output) = Command::new("which").arg("claude").output().await {
        if output.status.success() {
            let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path.is_empty() {
                return Ok(PathBuf::from(path));
            }
        }
    }

    let home = dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let candidates = [
        home.join(".claude").join("local").join("claude"),
        PathBuf::from("/usr/local/bin/claude"),
        PathBuf::from("/opt/homebrew/bin/claude"),
    ];
    for candidate in &candidates {
        if tokio::fs::try_exists(candidate).await.unwrap_or(false) {
            return Ok(candidate.clone());
        }
    }

    Err(crate::Error::Startup(
        "Claude Code CLI not found. Install it from https://claude.ai/code".to_string(),
    ))
}
