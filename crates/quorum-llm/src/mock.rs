use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use serde_json::Value;

use quorum_core::context::LlmContext;
use quorum_core::errors::GatewayError;
use quorum_core::ids::ToolCallId;
use quorum_core::messages::{AssistantMessage, StopReason, ToolCallBlock};
use quorum_core::provider::{EventStream, LlmProvider, StreamOptions};
use quorum_core::stream::StreamEvent;

use crate::reliable::Sleeper;

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield a sequence of StreamEvents.
    Stream(Vec<StreamEvent>),
    /// Return an error from the stream() call itself.
    Error(GatewayError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// A plain text answer delivered as one delta.
    pub fn stream_text(text: &str) -> Self {
        Self::stream_chunks(&[text])
    }

    /// A text answer delivered as several deltas.
    pub fn stream_chunks(chunks: &[&str]) -> Self {
        let mut events = vec![StreamEvent::Start];
        events.extend(chunks.iter().map(|c| StreamEvent::TextDelta {
            delta: (*c).to_string(),
        }));
        events.push(StreamEvent::Done {
            message: AssistantMessage::text(chunks.concat()),
            stop_reason: StopReason::EndTurn,
        });
        Self::Stream(events)
    }

    /// A turn that optionally says something, then calls the given tools.
    pub fn tool_calls(text: Option<&str>, calls: Vec<(&str, Value)>) -> Self {
        let mut events = vec![StreamEvent::Start];
        if let Some(text) = text {
            events.push(StreamEvent::TextDelta {
                delta: text.to_string(),
            });
        }
        let blocks: Vec<ToolCallBlock> = calls
            .into_iter()
            .map(|(name, arguments)| ToolCallBlock {
                id: ToolCallId::new(),
                name: name.to_string(),
                arguments,
            })
            .collect();
        for block in &blocks {
            events.push(StreamEvent::ToolCallStart {
                tool_call_id: block.id.clone(),
                name: block.name.clone(),
            });
            events.push(StreamEvent::ToolCallEnd {
                tool_call: block.clone(),
            });
        }
        events.push(StreamEvent::Done {
            message: AssistantMessage::with_tool_calls(text.map(str::to_string), blocks),
            stop_reason: StopReason::ToolUse,
        });
        Self::Stream(events)
    }

    /// A single tool call with the conventional free-text `input` argument.
    pub fn tool_call(name: &str, input: &str) -> Self {
        Self::tool_calls(None, vec![(name, serde_json::json!({ "input": input }))])
    }

    /// A stream that ends with an error event.
    pub fn stream_error(error: GatewayError) -> Self {
        Self::Stream(vec![StreamEvent::Start, StreamEvent::Error { error }])
    }

    /// A 429 returned from the stream() call itself.
    pub fn rate_limited() -> Self {
        Self::Error(GatewayError::RateLimited {
            message: "Too Many Requests".into(),
            retry_after: None,
        })
    }

    /// Wrap any response with a delay.
    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock provider that returns pre-programmed responses in sequence and
/// records every context it was called with.
pub struct MockProvider {
    responses: Vec<MockResponse>,
    calls: Mutex<Vec<LlmContext>>,
    model: String,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses,
            calls: Mutex::new(Vec::new()),
            model: "mock-model".into(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Contexts received so far, in call order.
    pub fn contexts(&self) -> Vec<LlmContext> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn supports_tools(&self) -> bool {
        true
    }

    async fn stream(
        &self,
        context: &LlmContext,
        _options: &StreamOptions,
    ) -> Result<EventStream, GatewayError> {
        let response = {
            let mut calls = self.calls.lock();
            let idx = calls.len();
            calls.push(context.clone());
            self.responses.get(idx).cloned()
        };

        match response {
            Some(response) => resolve_response(response).await,
            None => Err(GatewayError::InvalidRequest(format!(
                "MockProvider: no response configured for call {}",
                self.call_count() - 1
            ))),
        }
    }
}

/// Resolve a MockResponse, handling Delay by sleeping first.
/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_response(response: MockResponse) -> Result<EventStream, GatewayError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Stream(events) => return Ok(Box::pin(stream::iter(events))),
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}

/// Sleeper that records requested delays and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().push(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    async fn collect(mock: &MockProvider) -> Vec<StreamEvent> {
        let mut stream = mock
            .stream(&LlmContext::empty(), &StreamOptions::default())
            .await
            .unwrap();
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn text_response() {
        let mock = MockProvider::new(vec![MockResponse::stream_text("hello world")]);
        let events = collect(&mock).await;

        assert_eq!(events.len(), 3); // Start, TextDelta, Done
        assert!(matches!(events[0], StreamEvent::Start));
        if let StreamEvent::TextDelta { delta } = &events[1] {
            assert_eq!(delta, "hello world");
        } else {
            panic!("expected TextDelta");
        }
        assert!(matches!(events[2], StreamEvent::Done { .. }));
    }

    #[tokio::test]
    async fn tool_call_response() {
        let mock = MockProvider::new(vec![MockResponse::tool_call("market_analyst", "Brno")]);
        let events = collect(&mock).await;

        let ends: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolCallEnd { tool_call } => Some(tool_call),
                _ => None,
            })
            .collect();
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0].name, "market_analyst");
        assert_eq!(ends[0].arguments["input"], "Brno");

        match events.last() {
            Some(StreamEvent::Done {
                message,
                stop_reason,
            }) => {
                assert_eq!(*stop_reason, StopReason::ToolUse);
                assert_eq!(message.tool_calls().len(), 1);
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_response() {
        let mock = MockProvider::new(vec![MockResponse::Error(
            GatewayError::AuthenticationFailed("bad".into()),
        )]);
        let result = mock
            .stream(&LlmContext::empty(), &StreamOptions::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn sequential_responses_and_recorded_contexts() {
        let mock = MockProvider::new(vec![
            MockResponse::stream_text("first"),
            MockResponse::stream_text("second"),
        ]);

        let ctx = LlmContext::single("system", "question");
        assert!(mock.stream(&ctx, &StreamOptions::default()).await.is_ok());
        assert_eq!(mock.call_count(), 1);
        assert!(mock.stream(&ctx, &StreamOptions::default()).await.is_ok());
        assert_eq!(mock.call_count(), 2);
        assert_eq!(mock.contexts()[1].system_prompt, "system");
    }

    #[tokio::test]
    async fn exhausted_responses() {
        let mock = MockProvider::new(vec![MockResponse::stream_text("only one")]);
        let _ = mock
            .stream(&LlmContext::empty(), &StreamOptions::default())
            .await;
        let result = mock
            .stream(&LlmContext::empty(), &StreamOptions::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_error() {
        let mock = MockProvider::new(vec![MockResponse::delayed(
            Duration::from_millis(20),
            MockResponse::rate_limited(),
        )]);
        let result = mock
            .stream(&LlmContext::empty(), &StreamOptions::default())
            .await;
        match result {
            Err(GatewayError::RateLimited { .. }) => {}
            Err(other) => panic!("expected RateLimited, got: {other:?}"),
            Ok(_) => panic!("expected error"),
        }
    }

    #[tokio::test]
    async fn recording_sleeper_returns_immediately() {
        let sleeper = RecordingSleeper::default();
        sleeper.sleep(Duration::from_secs(3600)).await;
        assert_eq!(sleeper.delays(), vec![Duration::from_secs(3600)]);
    }
}
