use std::pin::Pin;
use std::sync::Arc;

use async_stream::stream;
use futures::{Stream, StreamExt};
use tracing::{debug, info, warn};

use quorum_core::context::LlmContext;
use quorum_core::messages::{Message, StopReason, ToolCallBlock};
use quorum_core::provider::{LlmProvider, StreamOptions};
use quorum_core::stream::StreamEvent;
use quorum_core::tools::ToolContext;

use crate::error::EngineError;
use crate::interceptor::ToolInterceptor;
use crate::registry::ToolRegistry;
use crate::truncate::{self, MAX_TOOL_OUTPUT};

/// Configuration for the agent runner.
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    /// Safety net against a model that never stops calling tools. Not a
    /// limit on how often any one tool may be called.
    pub max_turns: u32,
    pub stream_options: StreamOptions,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_turns: 50,
            stream_options: StreamOptions::default(),
        }
    }
}

/// One unit of the orchestrating agent's streamed output.
#[derive(Clone, Debug, PartialEq)]
pub enum AgentUpdate {
    /// Incremental answer text.
    Text(String),
    /// A tool call finished and its result was fed back to the model.
    ToolFinished { tool_name: String, is_error: bool },
    /// A model round trip ended.
    TurnComplete { turn: u32, stop_reason: StopReason },
}

pub type UpdateStream<'a> = Pin<Box<dyn Stream<Item = Result<AgentUpdate, EngineError>> + Send + 'a>>;

/// The orchestrating agent: an open-ended tool-calling loop.
///
/// Each turn streams one model response. Tool calls in it run one at a time
/// through the run's [`ToolInterceptor`], their results go back to the model,
/// and the loop repeats until a turn ends without tool calls.
pub struct AgentRunner {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    interceptor: Arc<ToolInterceptor>,
    config: RunnerConfig,
}

impl AgentRunner {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        interceptor: Arc<ToolInterceptor>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            provider,
            tools,
            interceptor,
            config,
        }
    }

    /// Run the loop for one user prompt.
    ///
    /// A unit is yielded after every tool call, so a consumer polling this
    /// stream gets a chance to drain the tool-call queue between calls. The
    /// stream ends after the first error.
    pub fn run<'a>(
        &'a self,
        system_prompt: String,
        prompt: String,
        ctx: ToolContext,
    ) -> UpdateStream<'a> {
        Box::pin(stream! {
            let definitions = self.tools.definitions();
            let mut messages = vec![Message::user_text(prompt)];
            let mut turn = 0u32;

            loop {
                if ctx.abort_signal.is_cancelled() {
                    yield Err(EngineError::Aborted);
                    return;
                }
                turn += 1;
                if turn > self.config.max_turns {
                    warn!(max_turns = self.config.max_turns, "agent exceeded max turns");
                    yield Err(EngineError::MaxTurnsExceeded(self.config.max_turns));
                    return;
                }

                let request = LlmContext {
                    system_prompt: system_prompt.clone(),
                    messages: messages.clone(),
                    tools: definitions.clone(),
                };
                let mut events = match self.provider.stream(&request, &self.config.stream_options).await {
                    Ok(events) => events,
                    Err(e) => {
                        yield Err(EngineError::Gateway(e));
                        return;
                    }
                };

                let mut done = None;
                while let Some(event) = events.next().await {
                    match event {
                        StreamEvent::TextDelta { delta } => {
                            if !delta.is_empty() {
                                yield Ok(AgentUpdate::Text(delta));
                            }
                        }
                        StreamEvent::Done { message, stop_reason } => {
                            done = Some((message, stop_reason));
                        }
                        StreamEvent::Error { error } => {
                            yield Err(EngineError::Gateway(error));
                            return;
                        }
                        _ => {}
                    }
                }

                let Some((message, stop_reason)) = done else {
                    yield Err(EngineError::Internal("stream ended without Done event".into()));
                    return;
                };
                let calls: Vec<ToolCallBlock> = message.tool_calls().into_iter().cloned().collect();
                messages.push(Message::Assistant(message));
                debug!(turn, tool_calls = calls.len(), "turn complete");
                yield Ok(AgentUpdate::TurnComplete { turn, stop_reason });

                if calls.is_empty() {
                    break;
                }

                for call in calls {
                    if ctx.abort_signal.is_cancelled() {
                        yield Err(EngineError::Aborted);
                        return;
                    }
                    let (content, is_error) = match self.tools.get(&call.name) {
                        Some(tool) => {
                            match self.interceptor.invoke(tool.as_ref(), call.arguments.clone(), &ctx).await {
                                Ok(result) => (
                                    truncate::truncate_output(&result.content, MAX_TOOL_OUTPUT),
                                    result.is_error,
                                ),
                                Err(e) => {
                                    yield Err(EngineError::Tool(e));
                                    return;
                                }
                            }
                        }
                        None => {
                            warn!(tool = %call.name, "model called unknown tool");
                            (format!("Unknown tool: {}", call.name), true)
                        }
                    };
                    messages.push(Message::tool_result(call.id.clone(), content, is_error));
                    yield Ok(AgentUpdate::ToolFinished { tool_name: call.name, is_error });
                }
            }

            info!(turns = turn, "agent run finished");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::CallCounters;
    use crate::queue::{tool_call_queue, ToolCallReceiver};
    use async_trait::async_trait;
    use quorum_core::errors::GatewayError;
    use quorum_core::events::ToolCallPhase;
    use quorum_core::ids::{OperationId, SessionId};
    use quorum_core::tools::{Tool, ToolError, ToolResult};
    use quorum_llm::{MockProvider, MockResponse};
    use serde_json::{json, Value};

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the input"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
            Ok(ToolResult::text(format!("echo: {}", args["input"].as_str().unwrap_or_default())))
        }
    }

    struct BrokenTool;

    #[async_trait]
    impl Tool for BrokenTool {
        fn name(&self) -> &str {
            "broken"
        }
        fn description(&self) -> &str {
            "Always fails"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
            Err(ToolError::ExecutionFailed("boom".into()))
        }
    }

    fn runner(
        provider: Arc<MockProvider>,
        config: RunnerConfig,
    ) -> (AgentRunner, ToolCallReceiver) {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(BrokenTool));
        let (tx, rx) = tool_call_queue(16);
        let interceptor = Arc::new(ToolInterceptor::new(tx, CallCounters::new()));
        (
            AgentRunner::new(provider, Arc::new(registry), interceptor, config),
            rx,
        )
    }

    fn ctx() -> ToolContext {
        ToolContext::new(SessionId::new(), OperationId::new())
    }

    async fn collect(runner: &AgentRunner, ctx: ToolContext) -> Vec<Result<AgentUpdate, EngineError>> {
        runner
            .run("system".into(), "question".into(), ctx)
            .collect()
            .await
    }

    #[tokio::test]
    async fn single_turn_text_response() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::stream_chunks(&[
            "Hello", " there",
        ])]));
        let (runner, mut rx) = runner(provider.clone(), RunnerConfig::default());

        let updates: Vec<AgentUpdate> = collect(&runner, ctx())
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(
            updates,
            vec![
                AgentUpdate::Text("Hello".into()),
                AgentUpdate::Text(" there".into()),
                AgentUpdate::TurnComplete {
                    turn: 1,
                    stop_reason: StopReason::EndTurn
                },
            ]
        );
        assert_eq!(provider.call_count(), 1);
        assert!(rx.drain().is_empty());

        let contexts = provider.contexts();
        let sent = &contexts[0];
        assert_eq!(sent.system_prompt, "system");
        assert_eq!(sent.tools.len(), 2);
    }

    #[tokio::test]
    async fn tool_results_are_fed_back() {
        let provider = Arc::new(MockProvider::new(vec![
            MockResponse::tool_call("echo", "ping"),
            MockResponse::stream_text("final"),
        ]));
        let (runner, mut rx) = runner(provider.clone(), RunnerConfig::default());

        let updates: Vec<AgentUpdate> = collect(&runner, ctx())
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert!(matches!(updates[0], AgentUpdate::TurnComplete { turn: 1, stop_reason: StopReason::ToolUse }));
        assert_eq!(
            updates[1],
            AgentUpdate::ToolFinished {
                tool_name: "echo".into(),
                is_error: false
            }
        );
        assert_eq!(updates[2], AgentUpdate::Text("final".into()));

        let contexts = provider.contexts();
        match contexts[1].messages.last().unwrap() {
            Message::ToolResult { content, is_error, .. } => {
                assert_eq!(content, "echo: ping");
                assert!(!is_error);
            }
            other => panic!("expected tool result, got {other:?}"),
        }

        let events = rx.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].phase, ToolCallPhase::Started);
        assert_eq!(events[1].phase, ToolCallPhase::Completed);
    }

    #[tokio::test]
    async fn tool_calls_in_one_turn_run_in_order() {
        let provider = Arc::new(MockProvider::new(vec![
            MockResponse::tool_calls(
                Some("checking"),
                vec![("echo", json!({"input": "a"})), ("echo", json!({"input": "b"}))],
            ),
            MockResponse::stream_text("done"),
        ]));
        let (runner, mut rx) = runner(provider, RunnerConfig::default());
        let updates = collect(&runner, ctx()).await;
        assert!(updates.iter().all(Result::is_ok));

        let numbers: Vec<(ToolCallPhase, u32)> =
            rx.drain().iter().map(|e| (e.phase, e.call_number)).collect();
        assert_eq!(
            numbers,
            vec![
                (ToolCallPhase::Started, 1),
                (ToolCallPhase::Completed, 1),
                (ToolCallPhase::Started, 2),
                (ToolCallPhase::Completed, 2),
            ]
        );
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_to_the_model() {
        let provider = Arc::new(MockProvider::new(vec![
            MockResponse::tool_call("nonexistent", "x"),
            MockResponse::stream_text("recovered"),
        ]));
        let (runner, mut rx) = runner(provider.clone(), RunnerConfig::default());
        let updates = collect(&runner, ctx()).await;
        assert!(updates.iter().all(Result::is_ok));
        assert!(rx.drain().is_empty());

        match provider.contexts()[1].messages.last().unwrap() {
            Message::ToolResult { content, is_error, .. } => {
                assert!(content.contains("Unknown tool"));
                assert!(is_error);
            }
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tool_failure_ends_the_run() {
        let provider = Arc::new(MockProvider::new(vec![
            MockResponse::tool_call("broken", "x"),
            MockResponse::stream_text("never"),
        ]));
        let (runner, mut rx) = runner(provider.clone(), RunnerConfig::default());
        let updates = collect(&runner, ctx()).await;

        assert!(matches!(updates.last(), Some(Err(EngineError::Tool(_)))));
        assert_eq!(provider.call_count(), 1);
        let events = rx.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].phase, ToolCallPhase::Started);
    }

    #[tokio::test]
    async fn max_turns_is_enforced() {
        let provider = Arc::new(MockProvider::new(vec![
            MockResponse::tool_call("echo", "1"),
            MockResponse::tool_call("echo", "2"),
            MockResponse::tool_call("echo", "3"),
        ]));
        let config = RunnerConfig {
            max_turns: 2,
            ..Default::default()
        };
        let (runner, _rx) = runner(provider, config);
        let updates = collect(&runner, ctx()).await;
        assert!(matches!(updates.last(), Some(Err(EngineError::MaxTurnsExceeded(2)))));
    }

    #[tokio::test]
    async fn gateway_errors_end_the_run() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::stream_error(
            GatewayError::ServerError {
                status: 500,
                body: "overloaded".into(),
            },
        )]));
        let (runner, _rx) = runner(provider, RunnerConfig::default());
        let updates = collect(&runner, ctx()).await;
        assert_eq!(updates.len(), 1);
        assert!(matches!(updates[0], Err(EngineError::Gateway(_))));
    }

    #[tokio::test]
    async fn cancelled_run_aborts() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::stream_text("hi")]));
        let (runner, _rx) = runner(provider.clone(), RunnerConfig::default());
        let ctx = ctx();
        ctx.abort_signal.cancel();
        let updates = collect(&runner, ctx).await;
        assert!(matches!(updates[0], Err(EngineError::Aborted)));
        assert_eq!(provider.call_count(), 0);
    }
}
