//! Scripted in-process agent engine
//!
//! Replays a fixed list of steps for every prompt. Backs the `echo` engine
//! and the orchestrator's tests; a [`ScriptProbe`] records what the
//! orchestrator asked of it.

use super::adapter::{
    check_working_directory, AdapterFactory, AgentAdapter, AgentEvent, AgentEventStream,
    ToolDecision, EVENT_CHANNEL_CAPACITY,
};
use crate::session::types::{Role, SessionOptions, TurnStats, Usage};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// One step of a scripted turn
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Emit assistant text
    Say(String),
    /// Emit reasoning text
    Think(String),
    /// Request a tool, wait for the decision, then report its output
    Tool {
        id: String,
        name: String,
        input: serde_json::Value,
        output: String,
    },
    /// Request approval and carry on without waiting for the decision
    Ask {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// Fail the engine
    Fail(String),
    /// Pause (lets tests act mid-turn)
    Sleep(Duration),
}

/// Produces the steps for a prompt
pub type Script = Arc<dyn Fn(&str) -> Vec<ScriptStep> + Send + Sync>;

/// What a scripted engine observed
#[derive(Debug, Clone, Default)]
pub struct ProbeState {
    pub starts: usize,
    pub started_with: Option<SessionOptions>,
    pub resumed_from: Option<String>,
    pub prompts: Vec<String>,
    pub decisions: Vec<(String, ToolDecision)>,
    pub executed_tools: Vec<String>,
    pub interrupts: usize,
    pub terminations: usize,
}

/// Shared view of one adapter's [`ProbeState`]
#[derive(Debug, Clone, Default)]
pub struct ScriptProbe(Arc<Mutex<ProbeState>>);

impl ScriptProbe {
    pub fn snapshot(&self) -> ProbeState {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, ProbeState> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

type DecisionMap = Arc<Mutex<HashMap<String, oneshot::Sender<ToolDecision>>>>;

/// Builds [`ScriptedAdapter`]s and keeps their probes
#[derive(Clone)]
pub struct ScriptedFactory {
    script: Script,
    probes: Arc<Mutex<HashMap<String, ScriptProbe>>>,
    fail_start: Arc<HashSet<String>>,
    fail_terminate: Arc<HashSet<String>>,
    on_interrupt: Arc<Vec<AgentEvent>>,
    terminate_delay: Option<Duration>,
}

impl ScriptedFactory {
    pub fn new(script: impl Fn(&str) -> Vec<ScriptStep> + Send + Sync + 'static) -> Self {
        Self {
            script: Arc::new(script),
            probes: Arc::new(Mutex::new(HashMap::new())),
            fail_start: Arc::new(HashSet::new()),
            fail_terminate: Arc::new(HashSet::new()),
            on_interrupt: Arc::new(Vec::new()),
            terminate_delay: None,
        }
    }

    /// Engine that answers every prompt with `echo: <prompt>`
    pub fn echo() -> Self {
        Self::new(|prompt| vec![ScriptStep::Say(format!("echo: {}", prompt))])
    }

    /// Make `start` fail for these sessions
    pub fn fail_start_for(mut self, ids: &[&str]) -> Self {
        self.fail_start = Arc::new(ids.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Make `terminate` fail for these sessions
    pub fn fail_terminate_for(mut self, ids: &[&str]) -> Self {
        self.fail_terminate = Arc::new(ids.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Events emitted after the turn is aborted by `interrupt`
    pub fn on_interrupt(mut self, events: Vec<AgentEvent>) -> Self {
        self.on_interrupt = Arc::new(events);
        self
    }

    /// Make `terminate` take this long
    pub fn slow_terminate(mut self, delay: Duration) -> Self {
        self.terminate_delay = Some(delay);
        self
    }

    /// Probe of the most recent adapter created for a session
    pub fn probe(&self, session_id: &str) -> Option<ScriptProbe> {
        self.probes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
    }
}

impl AdapterFactory for ScriptedFactory {
    fn create(&self, session_id: &str) -> Box<dyn AgentAdapter> {
        let probe = ScriptProbe::default();
        self.probes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id.to_string(), probe.clone());
        Box::new(ScriptedAdapter {
            session_id: session_id.to_string(),
            script: Arc::clone(&self.script),
            probe,
            fail_start: self.fail_start.contains(session_id),
            fail_terminate: self.fail_terminate.contains(session_id),
            on_interrupt: Arc::clone(&self.on_interrupt),
            terminate_delay: self.terminate_delay,
            events_tx: None,
            events_rx: None,
            decisions: Arc::new(Mutex::new(HashMap::new())),
            turn: None,
            running: false,
        })
    }
}

/// In-process engine replaying a [`Script`]
pub struct ScriptedAdapter {
    session_id: String,
    script: Script,
    probe: ScriptProbe,
    fail_start: bool,
    fail_terminate: bool,
    on_interrupt: Arc<Vec<AgentEvent>>,
    terminate_delay: Option<Duration>,
    events_tx: Option<mpsc::Sender<AgentEvent>>,
    events_rx: Option<AgentEventStream>,
    decisions: DecisionMap,
    turn: Option<JoinHandle<()>>,
    running: bool,
}

impl ScriptedAdapter {
    fn abort_turn(&mut self) {
        if let Some(turn) = self.turn.take() {
            turn.abort();
        }
        self.decisions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[async_trait]
impl AgentAdapter for ScriptedAdapter {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn start(&mut self, options: &SessionOptions, resume: Option<&str>) -> crate::Result<()> {
        check_working_directory(options).await?;
        if self.fail_start {
            return Err(crate::Error::Startup(format!(
                "scripted engine refused to start for {}",
                self.session_id
            )));
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.events_tx = Some(tx);
        self.events_rx = Some(rx);
        self.running = true;

        let mut probe = self.probe.lock();
        probe.starts += 1;
        probe.started_with = Some(options.clone());
        probe.resumed_from = resume.map(str::to_string);
        Ok(())
    }

    fn events(&mut self) -> Option<AgentEventStream> {
        self.events_rx.take()
    }

    async fn send(&mut self, prompt: &str) -> crate::Result<()> {
        let tx = match (&self.events_tx, self.running) {
            (Some(tx), true) => tx.clone(),
            _ => return Err(crate::Error::Adapter("scripted engine is not running".to_string())),
        };
        self.probe.lock().prompts.push(prompt.to_string());

        let steps = (self.script)(prompt);
        let decisions = Arc::clone(&self.decisions);
        let probe = self.probe.clone();
        self.turn = Some(tokio::spawn(run_turn(steps, tx, decisions, probe)));
        Ok(())
    }

    async fn authorize(&mut self, tool_use_id: &str, decision: &ToolDecision) -> crate::Result<()> {
        let waiter = self
            .decisions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(tool_use_id)
            .ok_or_else(|| {
                crate::Error::Adapter(format!("No pending approval for tool {}", tool_use_id))
            })?;
        self.probe
            .lock()
            .decisions
            .push((tool_use_id.to_string(), decision.clone()));
        let _ = waiter.send(decision.clone());
        Ok(())
    }

    async fn interrupt(&mut self) -> crate::Result<()> {
        self.abort_turn();
        self.probe.lock().interrupts += 1;
        if let Some(tx) = &self.events_tx {
            for event in self.on_interrupt.iter() {
                let _ = tx.send(event.clone()).await;
            }
        }
        Ok(())
    }

    async fn terminate(&mut self) -> crate::Result<()> {
        if !self.running {
            return Ok(());
        }
        self.running = false;
        self.abort_turn();
        self.events_tx = None;
        self.probe.lock().terminations += 1;
        if let Some(delay) = self.terminate_delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_terminate {
            return Err(crate::Error::Adapter(format!(
                "scripted engine failed to stop {}",
                self.session_id
            )));
        }
        Ok(())
    }
}

async fn run_turn(
    steps: Vec<ScriptStep>,
    tx: mpsc::Sender<AgentEvent>,
    decisions: DecisionMap,
    probe: ScriptProbe,
) {
    let started = Instant::now();
    let mut thinking = true;
    if tx.send(AgentEvent::Thinking(true)).await.is_err() {
        return;
    }

    for step in steps {
        let mut events = Vec::new();
        if thinking && !matches!(step, ScriptStep::Sleep(_)) {
            thinking = false;
            events.push(AgentEvent::Thinking(false));
        }
        match step {
            ScriptStep::Say(text) => events.push(AgentEvent::ContentChunk {
                role: Role::Assistant,
                text,
            }),
            ScriptStep::Think(text) => events.push(AgentEvent::ThinkingText(text)),
            ScriptStep::Sleep(duration) => tokio::time::sleep(duration).await,
            ScriptStep::Fail(message) => {
                events.push(AgentEvent::Fatal(message));
                for event in events {
                    let _ = tx.send(event).await;
                }
                return;
            }
            ScriptStep::Tool {
                id,
                name,
                input,
                output,
            } => {
                let (decided_tx, decided_rx) = oneshot::channel();
                decisions
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(id.clone(), decided_tx);
                events.push(AgentEvent::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                });
                events.push(AgentEvent::ToolApproval {
                    id: id.clone(),
                    name,
                    input,
                });
                for event in events.drain(..) {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }

                let Ok(decision) = decided_rx.await else {
                    return;
                };
                let result = match decision {
                    ToolDecision::Allow => {
                        probe.lock().executed_tools.push(id.clone());
                        AgentEvent::ToolResult {
                            id,
                            content: output,
                            is_error: false,
                        }
                    }
                    ToolDecision::Deny { reason } => AgentEvent::ToolResult {
                        id,
                        content: reason,
                        is_error: true,
                    },
                };
                events.push(result);
            }
            ScriptStep::Ask { id, name, input } => {
                let (decided_tx, _) = oneshot::channel();
                decisions
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(id.clone(), decided_tx);
                events.push(AgentEvent::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                });
                events.push(AgentEvent::ToolApproval { id, name, input });
            }
        }
        for event in events {
            if tx.send(event).await.is_err() {
                return;
            }
        }
    }

    if thinking {
        let _ = tx.send(AgentEvent::Thinking(false)).await;
    }
    let _ = tx
        .send(AgentEvent::TurnComplete(TurnStats {
            cost_usd: 0.0,
            num_turns: 1,
            duration_ms: started.elapsed().as_millis() as u64,
            usage: Usage::default(),
            is_error: false,
        }))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_non_thinking(events: &mut AgentEventStream) -> AgentEvent {
        loop {
            match events.recv().await {
                Some(AgentEvent::Thinking(_)) => continue,
                Some(event) => return event,
                None => panic!("event stream closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_echo_turn() {
        let factory = ScriptedFactory::echo();
        let mut adapter = factory.create("s1");
        adapter.start(&SessionOptions::default(), None).await.unwrap();
        let mut events = adapter.events().unwrap();

        adapter.send("hello").await.unwrap();
        assert_eq!(events.recv().await, Some(AgentEvent::Thinking(true)));
        assert_eq!(events.recv().await, Some(AgentEvent::Thinking(false)));
        assert_eq!(
            events.recv().await,
            Some(AgentEvent::ContentChunk {
                role: Role::Assistant,
                text: "echo: hello".to_string()
            })
        );
        assert!(matches!(
            events.recv().await,
            Some(AgentEvent::TurnComplete(_))
        ));
        assert_eq!(factory.probe("s1").unwrap().snapshot().prompts, vec!["hello"]);
    }

    #[tokio::test]
    async fn test_tool_waits_for_decision() {
        let factory = ScriptedFactory::new(|_| {
            vec![ScriptStep::Tool {
                id: "t1".to_string(),
                name: "Bash".to_string(),
                input: serde_json::json!({"command": "ls"}),
                output: "a.txt".to_string(),
            }]
        });
        let mut adapter = factory.create("s1");
        adapter.start(&SessionOptions::default(), None).await.unwrap();
        let mut events = adapter.events().unwrap();
        adapter.send("go").await.unwrap();

        assert!(matches!(
            next_non_thinking(&mut events).await,
            AgentEvent::ToolUse { .. }
        ));
        assert!(matches!(
            next_non_thinking(&mut events).await,
            AgentEvent::ToolApproval { .. }
        ));
        tokio_test::assert_err!(adapter.authorize("t-unknown", &ToolDecision::Allow).await);

        adapter
            .authorize(
                "t1",
                &ToolDecision::Deny {
                    reason: "no".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            next_non_thinking(&mut events).await,
            AgentEvent::ToolResult {
                id: "t1".to_string(),
                content: "no".to_string(),
                is_error: true
            }
        );
        let state = factory.probe("s1").unwrap().snapshot();
        assert!(state.executed_tools.is_empty());
        assert_eq!(state.decisions.len(), 1);
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let factory = ScriptedFactory::echo();
        let mut adapter = factory.create("s1");
        adapter.start(&SessionOptions::default(), None).await.unwrap();

        tokio_test::assert_ok!(adapter.terminate().await);
        tokio_test::assert_ok!(adapter.terminate().await);
        assert_eq!(factory.probe("s1").unwrap().snapshot().terminations, 1);
        tokio_test::assert_err!(adapter.send("late").await);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let factory = ScriptedFactory::echo()
            .fail_start_for(&["bad-start"])
            .fail_terminate_for(&["bad-stop"]);

        let mut adapter = factory.create("bad-start");
        let err = adapter
            .start(&SessionOptions::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::Startup(_)));

        let mut adapter = factory.create("bad-stop");
        adapter.start(&SessionOptions::default(), None).await.unwrap();
        assert!(adapter.terminate().await.is_err());
        // Second call is a no-op even after a failed stop
        assert!(adapter.terminate().await.is_ok());
    }
}
