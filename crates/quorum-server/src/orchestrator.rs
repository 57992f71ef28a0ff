//! Drives one session run from `running` to a terminal state and produces
//! the run's event stream.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use chrono::Utc;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use quorum_core::events::{Event, EventType, ToolCallPhase};
use quorum_core::ids::{OperationId, SessionId};
use quorum_core::provider::LlmProvider;
use quorum_core::tools::ToolContext;
use quorum_engine::{
    prompts, tool_call_queue, AgentRunner, AgentTool, AgentUpdate, CallCounters, RunnerConfig,
    SpecialistAgent, ToolCallEvent, ToolInterceptor, ToolRegistry, WorkspaceAction,
    WorkspaceBackend, WorkspaceTool, DEFAULT_QUEUE_CAPACITY, WORKSPACE_TOOL_NAME,
};
use quorum_store::{AgentResult, SessionStore, StoreError, ToolCallLogEntry};

/// Name the orchestrating agent reports itself under.
pub const ORCHESTRATOR_AGENT: &str = "orchestrator";

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub runner: RunnerConfig,
    pub queue_capacity: usize,
    /// Upper bound on a single tool call. `None` waits indefinitely.
    pub tool_timeout: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            runner: RunnerConfig::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            tool_timeout: None,
        }
    }
}

/// A session already moved to `running`, ready to execute.
#[derive(Debug)]
pub struct StartedRun {
    pub session_id: SessionId,
    pub operation_id: OperationId,
    query: String,
    context: Option<Map<String, Value>>,
    cancel: CancellationToken,
}

/// Coordinates the orchestrating agent and its specialists for each session.
///
/// Per-run state (tool-call queue, call counters, log) is created inside
/// [`ResearchOrchestrator::run`] and never shared; the session store is the
/// only state shared between runs.
pub struct ResearchOrchestrator {
    store: Arc<SessionStore>,
    provider: Arc<dyn LlmProvider>,
    specialists: Vec<Arc<dyn SpecialistAgent>>,
    workspace: Option<Arc<dyn WorkspaceBackend>>,
    config: OrchestratorConfig,
    active_runs: DashMap<SessionId, CancellationToken>,
}

impl ResearchOrchestrator {
    pub fn new(
        store: Arc<SessionStore>,
        provider: Arc<dyn LlmProvider>,
        specialists: Vec<Arc<dyn SpecialistAgent>>,
    ) -> Self {
        Self {
            store,
            provider,
            specialists,
            workspace: None,
            config: OrchestratorConfig::default(),
            active_runs: DashMap::new(),
        }
    }

    pub fn with_workspace(mut self, workspace: Arc<dyn WorkspaceBackend>) -> Self {
        self.workspace = Some(workspace);
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Move a pending session to `running` and assign its operation id.
    ///
    /// Fails with `NotFound` for an unknown session and `InvalidState` for
    /// one that is not pending, so a session is started at most once.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn begin(&self, id: &SessionId) -> Result<StartedRun, StoreError> {
        let operation_id = OperationId::new();
        let session = self.store.mark_running(id, operation_id.clone())?;
        let cancel = CancellationToken::new();
        self.active_runs.insert(id.clone(), cancel.clone());
        info!(operation_id = %operation_id, "session started");
        Ok(StartedRun {
            session_id: session.id,
            operation_id,
            query: session.query,
            context: session.context,
            cancel,
        })
    }

    /// Request cancellation of a running session. Returns false if the
    /// session has no active run.
    pub fn cancel(&self, id: &SessionId) -> bool {
        match self.active_runs.get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        for entry in self.active_runs.iter() {
            entry.value().cancel();
        }
        self.active_runs.len()
    }

    pub fn is_running(&self, id: &SessionId) -> bool {
        self.active_runs.contains_key(id)
    }

    fn build_tools(&self) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        for specialist in &self.specialists {
            registry.register(Arc::new(AgentTool::new(Arc::clone(specialist))));
        }
        if let Some(workspace) = &self.workspace {
            registry.register(Arc::new(WorkspaceTool::new(Arc::clone(workspace))));
        }
        registry
    }

    /// Execute a started run. The stream always ends with exactly one of
    /// `workflow_completed` or `workflow_failed`.
    pub fn run(self: &Arc<Self>, started: StartedRun) -> impl Stream<Item = Event> + Send + 'static {
        let this = Arc::clone(self);
        stream! {
            let StartedRun { session_id, operation_id, query, context, cancel } = started;
            let run_start = Instant::now();
            let mut run = RunLog::default();

            yield Event::new(EventType::SessionStarted, &session_id, json!({
                "query": query,
                "operation_id": operation_id,
                "started_at": Utc::now(),
            }));

            let outcome: Result<(), String> = 'run: {
                let registry = this.build_tools();
                let definitions = registry.definitions();
                let tools: Vec<Value> = definitions
                    .iter()
                    .map(|d| json!({ "name": d.name, "description": d.description }))
                    .collect();
                yield Event::new(EventType::AgentStarted, &session_id, json!({
                    "agent": ORCHESTRATOR_AGENT,
                    "model": this.provider.model(),
                    "tools": tools,
                    "workspace": this.workspace.is_some(),
                }));

                let (queue, mut pending) = tool_call_queue(this.config.queue_capacity);
                let mut interceptor = ToolInterceptor::new(queue, CallCounters::new());
                if let Some(limit) = this.config.tool_timeout {
                    interceptor = interceptor.with_timeout(limit);
                }
                let interceptor = Arc::new(interceptor);
                let runner = AgentRunner::new(
                    Arc::clone(&this.provider),
                    Arc::new(registry),
                    Arc::clone(&interceptor),
                    this.config.runner.clone(),
                );

                yield Event::new(EventType::SynthesisStarted, &session_id, json!({
                    "agent": ORCHESTRATOR_AGENT,
                }));

                let tool_ctx = ToolContext {
                    session_id: session_id.clone(),
                    operation_id: operation_id.clone(),
                    abort_signal: cancel.clone(),
                };
                let mut updates = runner.run(
                    prompts::orchestrator_prompt(&definitions),
                    user_prompt(&query, context.as_ref()),
                    tool_ctx,
                );

                let mut failure = None;
                while let Some(update) = updates.next().await {
                    for call in pending.drain() {
                        for event in run.record(&session_id, call) {
                            yield event;
                        }
                    }
                    match update {
                        Ok(AgentUpdate::Text(delta)) => {
                            run.text.push_str(&delta);
                            yield Event::new(EventType::AgentProgress, &session_id, json!({
                                "agent": ORCHESTRATOR_AGENT,
                                "content": delta,
                            }));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            failure = Some(e.to_string());
                            break;
                        }
                    }
                }
                drop(updates);

                for call in pending.close_and_drain() {
                    for event in run.record(&session_id, call) {
                        yield event;
                    }
                }
                if let Some(error) = failure {
                    break 'run Err(error);
                }

                let counts = interceptor.call_counts();
                let total_calls = interceptor.total_calls();
                let duration_ms = run_start.elapsed().as_millis() as u64;
                let result = AgentResult {
                    agent: ORCHESTRATOR_AGENT.into(),
                    content: run.text.clone(),
                    duration_ms,
                    timestamp: Utc::now(),
                    metadata: run.metadata(&counts, &operation_id),
                };
                if let Err(e) = this.store.append_result(&session_id, result) {
                    break 'run Err(e.to_string());
                }
                yield Event::new(EventType::SynthesisCompleted, &session_id, json!({
                    "agent": ORCHESTRATOR_AGENT,
                    "content": run.text,
                    "duration_ms": duration_ms,
                }));

                if let Some(workspace) = &this.workspace {
                    match workspace.list_sections(&session_id).await {
                        Ok(sections) => {
                            yield Event::new(EventType::ScratchpadSnapshot, &session_id, json!({
                                "sections": sections,
                            }));
                        }
                        Err(e) => warn!(session_id = %session_id, error = %e, "workspace snapshot failed"),
                    }
                }

                let session = match this.store.mark_completed(&session_id, run.text.clone()) {
                    Ok(session) => session,
                    Err(e) => break 'run Err(e.to_string()),
                };
                info!(
                    session_id = %session_id,
                    tool_calls = total_calls,
                    duration_ms = run_start.elapsed().as_millis() as u64,
                    "workflow completed"
                );
                yield Event::new(EventType::WorkflowCompleted, &session_id, json!({
                    "duration_ms": run_start.elapsed().as_millis() as u64,
                    "tool_calls": total_calls,
                    "tool_call_counts": counts,
                    "results": session.results.len(),
                }));
                Ok(())
            };

            if let Err(error) = outcome {
                warn!(session_id = %session_id, error = %error, "workflow failed");
                if let Err(e) = this.store.mark_failed(&session_id, error.clone()) {
                    warn!(session_id = %session_id, error = %e, "could not record failure");
                }
                let open = ToolCallLogEntry::open_calls(&run.log);
                for (tool_name, call_number) in &open {
                    yield Event::new(EventType::AgentFailed, &session_id, json!({
                        "agent": tool_name,
                        "call_number": call_number,
                        "error": error,
                    }));
                }
                let abandoned: Vec<Value> = open
                    .into_iter()
                    .map(|(tool_name, call_number)| json!({ "tool_name": tool_name, "call_number": call_number }))
                    .collect();
                yield Event::new(EventType::WorkflowFailed, &session_id, json!({
                    "error": error,
                    "duration_ms": run_start.elapsed().as_millis() as u64,
                    "tool_calls": run.annotated_log(),
                    "abandoned": abandoned,
                }));
            }

            this.active_runs.remove(&session_id);
        }
    }
}

fn user_prompt(query: &str, context: Option<&Map<String, Value>>) -> String {
    match context.filter(|c| !c.is_empty()) {
        Some(context) => format!(
            "{query}\n\nAdditional context:\n{}",
            serde_json::to_string_pretty(context).unwrap_or_default()
        ),
        None => query.to_string(),
    }
}

/// Tool-call log and answer text accumulated during one run.
#[derive(Default)]
struct RunLog {
    log: Vec<ToolCallLogEntry>,
    text: String,
}

impl RunLog {
    /// Append one drained tool-call phase to the log and return the events
    /// it is reported as.
    fn record(&mut self, session_id: &SessionId, call: ToolCallEvent) -> Vec<Event> {
        let mut events = Vec::with_capacity(2);
        match call.phase {
            ToolCallPhase::Started => {
                events.push(Event::new(call.phase.event_type(), session_id, json!({
                    "agent": call.tool_name,
                    "call_number": call.call_number,
                    "input": call.args_preview,
                    "message": format!("Calling {} (call #{})", call.tool_name, call.call_number),
                })));
            }
            ToolCallPhase::Completed => {
                events.push(Event::new(call.phase.event_type(), session_id, json!({
                    "agent": call.tool_name,
                    "call_number": call.call_number,
                    "duration_ms": call.duration_ms,
                    "result_preview": call.result_preview,
                    "is_error": call.is_error,
                })));
                if call.tool_name == WORKSPACE_TOOL_NAME && !call.is_error {
                    events.extend(workspace_event(session_id, &call));
                }
            }
        }

        self.log.push(ToolCallLogEntry {
            phase: call.phase,
            tool_name: call.tool_name,
            call_number: call.call_number,
            timestamp: call.timestamp,
            args_preview: call.args_preview,
            duration_ms: call.duration_ms,
            result_preview: call.result_preview,
        });
        events
    }

    fn metadata(&self, counts: &BTreeMap<String, u32>, operation_id: &OperationId) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert("tool_call_counts".into(), json!(counts));
        metadata.insert("tool_calls".into(), json!(self.log));
        metadata.insert("operation_id".into(), json!(operation_id));
        metadata
    }

    /// The log with every started-but-never-completed entry marked
    /// `"status": "abandoned"`.
    fn annotated_log(&self) -> Vec<Value> {
        let open = ToolCallLogEntry::open_calls(&self.log);
        self.log
            .iter()
            .map(|entry| {
                let mut value = json!(entry);
                let is_open = entry.phase == ToolCallPhase::Started
                    && open
                        .iter()
                        .any(|(name, n)| *name == entry.tool_name && *n == entry.call_number);
                if is_open {
                    value["status"] = json!("abandoned");
                }
                value
            })
            .collect()
    }
}

/// Side event for a successful shared-workspace call, if the action has one.
fn workspace_event(session_id: &SessionId, call: &ToolCallEvent) -> Option<Event> {
    match WorkspaceAction::from_args(&call.arguments)? {
        WorkspaceAction::WriteSection => Some(Event::new(
            EventType::ScratchpadUpdated,
            session_id,
            json!({
                "section": call.arguments["section"],
                "call_number": call.call_number,
            }),
        )),
        WorkspaceAction::AddQuestion => Some(Event::new(
            EventType::QuestionAdded,
            session_id,
            json!({ "question": call.arguments["question"] }),
        )),
        WorkspaceAction::GetAnsweredQuestions => Some(Event::new(
            EventType::QuestionsAnswered,
            session_id,
            json!({
                "call_number": call.call_number,
                "result_preview": call.result_preview,
            }),
        )),
        WorkspaceAction::ReadSection | WorkspaceAction::ListSections => None,
    }
}
