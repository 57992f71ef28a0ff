//! Specialist agents and the adapter exposing each one as a single-argument
//! tool to the orchestrating agent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use quorum_core::context::LlmContext;
use quorum_core::errors::GatewayError;
use quorum_core::provider::{LlmProvider, StreamOptions};
use quorum_core::retry::RetryPolicy;
use quorum_core::stream::StreamEvent;
use quorum_core::tools::{Tool, ToolContext, ToolError, ToolResult};
use quorum_llm::{retry_after_header, retry_call, ReliableProvider, Sleeper, TokioSleeper};

/// Header carrying the run's correlation identifier to remote specialists.
pub const OPERATION_ID_HEADER: &str = "x-operation-id";

const REMOTE_TIMEOUT: Duration = Duration::from_secs(300);

/// A narrowly scoped agent: free text in, free text out.
#[async_trait]
pub trait SpecialistAgent: Send + Sync {
    fn name(&self) -> &str;

    /// Used by the orchestrating model to decide when to call this agent.
    fn description(&self) -> &str;

    async fn run(&self, input: &str, ctx: &ToolContext) -> Result<String, ToolError>;
}

/// Specialist answered by one model call with a fixed system prompt and no
/// tools. The call is retried on rate limits.
pub struct LlmSpecialist {
    name: String,
    description: String,
    system_prompt: String,
    provider: ReliableProvider<Arc<dyn LlmProvider>>,
    options: StreamOptions,
}

impl LlmSpecialist {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        system_prompt: impl Into<String>,
        provider: Arc<dyn LlmProvider>,
        policy: RetryPolicy,
    ) -> Self {
        Self::with_provider(
            name,
            description,
            system_prompt,
            ReliableProvider::new(provider, policy),
        )
    }

    pub fn with_provider(
        name: impl Into<String>,
        description: impl Into<String>,
        system_prompt: impl Into<String>,
        provider: ReliableProvider<Arc<dyn LlmProvider>>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            system_prompt: system_prompt.into(),
            provider,
            options: StreamOptions::default(),
        }
    }

    pub fn with_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }
}

#[async_trait]
impl SpecialistAgent for LlmSpecialist {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    #[instrument(skip(self, input, ctx), fields(agent = %self.name, session_id = %ctx.session_id))]
    async fn run(&self, input: &str, ctx: &ToolContext) -> Result<String, ToolError> {
        let context = LlmContext::single(&self.system_prompt, input);
        let mut stream = self
            .provider
            .stream(&context, &self.options)
            .await
            .map_err(gateway_failure)?;

        let mut text = String::new();
        while let Some(event) = stream.next().await {
            if ctx.abort_signal.is_cancelled() {
                return Err(ToolError::Cancelled);
            }
            match event {
                StreamEvent::TextDelta { delta } => text.push_str(&delta),
                StreamEvent::Done { message, .. } => {
                    let full = message.text_content();
                    if !full.is_empty() {
                        text = full;
                    }
                }
                StreamEvent::Error { error } => return Err(gateway_failure(error)),
                _ => {}
            }
        }
        debug!(chars = text.len(), "specialist answered");
        Ok(text)
    }
}

fn gateway_failure(error: GatewayError) -> ToolError {
    ToolError::ExecutionFailed(error.to_string())
}

/// Specialist hosted elsewhere, reached over HTTP.
///
/// `POST {endpoint}` with `{"input": ...}` answers `{"output": ...}`. The
/// run's operation id travels in `x-operation-id` and as the trace id of a
/// W3C `traceparent`, so spans recorded by the remote runtime can be joined
/// with this run.
pub struct RemoteSpecialist {
    name: String,
    description: String,
    endpoint: String,
    api_key: Option<SecretString>,
    client: Client,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

#[derive(Deserialize)]
struct RemoteReply {
    output: Option<String>,
}

impl RemoteSpecialist {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        endpoint: impl Into<String>,
        policy: RetryPolicy,
    ) -> Result<Self, ToolError> {
        let client = Client::builder()
            .timeout(REMOTE_TIMEOUT)
            .build()
            .map_err(|e| ToolError::ExecutionFailed(format!("http client: {e}")))?;
        Ok(Self {
            name: name.into(),
            description: description.into(),
            endpoint: endpoint.into(),
            api_key: None,
            client,
            policy,
            sleeper: Arc::new(TokioSleeper),
        })
    }

    pub fn with_api_key(mut self, key: SecretString) -> Self {
        self.api_key = Some(key);
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    async fn call_once(&self, input: &str, ctx: &ToolContext) -> Result<String, GatewayError> {
        let mut req = self
            .client
            .post(&self.endpoint)
            .header(OPERATION_ID_HEADER, ctx.operation_id.as_str())
            .header("traceparent", traceparent(ctx.operation_id.as_str()))
            .header("x-session-id", ctx.session_id.as_str())
            .json(&json!({ "input": input }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(REMOTE_TIMEOUT)
            } else {
                GatewayError::NetworkError(e.to_string())
            }
        })?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry_after = retry_after_header(&resp);
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status, body, retry_after));
        }

        let reply: RemoteReply = resp
            .json()
            .await
            .map_err(|e| GatewayError::StreamInterrupted(format!("malformed reply: {e}")))?;
        reply
            .output
            .ok_or_else(|| GatewayError::StreamInterrupted("reply has no output".into()))
    }
}

/// `traceparent` header value with the given trace id and a fresh span id.
fn traceparent(trace_id: &str) -> String {
    format!("00-{trace_id}-{:016x}-01", rand::random::<u64>())
}

#[async_trait]
impl SpecialistAgent for RemoteSpecialist {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    #[instrument(skip(self, input, ctx), fields(agent = %self.name, operation_id = %ctx.operation_id))]
    async fn run(&self, input: &str, ctx: &ToolContext) -> Result<String, ToolError> {
        retry_call(
            &self.policy,
            self.sleeper.as_ref(),
            GatewayError::retry_verdict,
            || self.call_once(input, ctx),
        )
        .await
        .map_err(gateway_failure)
    }
}

/// Exposes a [`SpecialistAgent`] as a tool taking one free-text `input`.
pub struct AgentTool {
    agent: Arc<dyn SpecialistAgent>,
}

impl AgentTool {
    pub fn new(agent: Arc<dyn SpecialistAgent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl Tool for AgentTool {
    fn name(&self) -> &str {
        self.agent.name()
    }

    fn description(&self) -> &str {
        self.agent.description()
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["input"],
            "properties": {
                "input": {
                    "type": "string",
                    "description": "The question or task for this agent, in plain language"
                }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let Some(input) = args["input"].as_str().filter(|s| !s.trim().is_empty()) else {
            return Ok(ToolResult::error("input is required"));
        };
        let output = self.agent.run(input, ctx).await?;
        Ok(ToolResult::text(output))
    }
}
