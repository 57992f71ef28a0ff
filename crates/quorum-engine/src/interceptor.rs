use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use quorum_core::events::ToolCallPhase;
use quorum_core::tools::{Tool, ToolContext, ToolError, ToolResult};

use crate::queue::{ToolCallEvent, ToolCallSender};
use crate::truncate::{self, PREVIEW_CHARS};

/// Per-tool call counters for one run.
#[derive(Debug, Default)]
pub struct CallCounters {
    counts: HashMap<String, u32>,
}

impl CallCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment and return the ordinal for the next call to `tool`.
    pub fn next(&mut self, tool: &str) -> u32 {
        let n = self.counts.entry(tool.to_string()).or_insert(0);
        *n += 1;
        *n
    }

    pub fn snapshot(&self) -> BTreeMap<String, u32> {
        self.counts.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }

    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }
}

/// Wraps every tool invocation of one run, reporting `started` and
/// `completed` phases onto the run's tool-call queue.
///
/// A call that fails propagates its error after `started` was reported and
/// never reports `completed`.
pub struct ToolInterceptor {
    queue: ToolCallSender,
    counters: Mutex<CallCounters>,
    timeout: Option<Duration>,
}

impl ToolInterceptor {
    pub fn new(queue: ToolCallSender, counters: CallCounters) -> Self {
        Self {
            queue,
            counters: Mutex::new(counters),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Calls made so far, per tool name.
    pub fn call_counts(&self) -> BTreeMap<String, u32> {
        self.counters.lock().snapshot()
    }

    /// Calls made so far across all tools.
    pub fn total_calls(&self) -> u32 {
        self.counters.lock().total()
    }

    pub async fn invoke(
        &self,
        tool: &dyn Tool,
        args: Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let tool_name = tool.name().to_string();
        let call_number = self.counters.lock().next(&tool_name);

        self.queue
            .send(ToolCallEvent {
                phase: ToolCallPhase::Started,
                tool_name: tool_name.clone(),
                call_number,
                timestamp: Utc::now(),
                args_preview: Some(truncate::args_preview(&args, PREVIEW_CHARS)),
                arguments: args.clone(),
                duration_ms: None,
                result_preview: None,
                is_error: false,
            })
            .await;
        debug!(tool = %tool_name, call_number, "tool call started");

        let start = Instant::now();
        let result = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, tool.execute(args.clone(), ctx)).await {
                Ok(result) => result,
                Err(_) => Err(ToolError::Timeout(limit)),
            },
            None => tool.execute(args.clone(), ctx).await,
        };
        let duration = start.elapsed();

        let result = match result {
            Ok(result) => result,
            Err(e) => {
                warn!(tool = %tool_name, call_number, error = %e, "tool call failed");
                return Err(e);
            }
        };

        self.queue
            .send(ToolCallEvent {
                phase: ToolCallPhase::Completed,
                tool_name: tool_name.clone(),
                call_number,
                timestamp: Utc::now(),
                arguments: args,
                args_preview: None,
                duration_ms: Some(duration.as_millis() as u64),
                result_preview: Some(truncate::preview(&result.content, PREVIEW_CHARS)),
                is_error: result.is_error,
            })
            .await;
        debug!(
            tool = %tool_name,
            call_number,
            duration_ms = duration.as_millis() as u64,
            "tool call completed"
        );

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::tool_call_queue;
    use async_trait::async_trait;
    use quorum_core::ids::{OperationId, SessionId};
    use serde_json::json;

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
            Ok(ToolResult::text(args["input"].as_str().unwrap_or_default()))
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
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
            Err(ToolError::ExecutionFailed("upstream 500".into()))
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "Sleeps"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(ToolResult::text("late"))
        }
    }

    fn ctx() -> ToolContext {
        ToolContext::new(SessionId::new(), OperationId::new())
    }

    #[tokio::test]
    async fn started_then_completed_with_counters() {
        let (tx, mut rx) = tool_call_queue(16);
        let interceptor = ToolInterceptor::new(tx, CallCounters::new());

        let r = interceptor
            .invoke(&EchoTool, json!({"input": "first"}), &ctx())
            .await
            .unwrap();
        assert_eq!(r.content, "first");
        interceptor
            .invoke(&EchoTool, json!({"input": "second"}), &ctx())
            .await
            .unwrap();

        let events = rx.drain();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].phase, ToolCallPhase::Started);
        assert_eq!(events[0].call_number, 1);
        assert_eq!(events[0].args_preview.as_deref(), Some("first"));
        assert_eq!(events[1].phase, ToolCallPhase::Completed);
        assert_eq!(events[1].call_number, 1);
        assert_eq!(events[1].result_preview.as_deref(), Some("first"));
        assert!(events[1].duration_ms.is_some());
        assert_eq!(events[2].call_number, 2);
        assert_eq!(events[3].call_number, 2);

        assert_eq!(interceptor.call_counts().get("echo"), Some(&2));
    }

    #[tokio::test]
    async fn failure_propagates_without_completed() {
        let (tx, mut rx) = tool_call_queue(16);
        let interceptor = ToolInterceptor::new(tx, CallCounters::new());

        let err = interceptor
            .invoke(&FailingTool, json!({"input": "x"}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed(_)));

        let events = rx.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].phase, ToolCallPhase::Started);
        assert_eq!(events[0].tool_name, "broken");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_a_failure() {
        let (tx, mut rx) = tool_call_queue(16);
        let interceptor =
            ToolInterceptor::new(tx, CallCounters::new()).with_timeout(Duration::from_secs(5));

        let err = interceptor.invoke(&SlowTool, json!({}), &ctx()).await.unwrap_err();
        assert!(matches!(err, ToolError::Timeout(_)));
        assert_eq!(rx.drain().len(), 1);
    }

    #[test]
    fn counters_are_per_tool() {
        let mut counters = CallCounters::new();
        assert_eq!(counters.next("a"), 1);
        assert_eq!(counters.next("b"), 1);
        assert_eq!(counters.next("a"), 2);
        assert_eq!(counters.total(), 3);
        assert_eq!(counters.snapshot().get("a"), Some(&2));
    }
}
