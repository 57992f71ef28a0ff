use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use quorum_core::errors::GatewayError;
use quorum_core::ids::ToolCallId;
use quorum_core::messages::{AssistantMessage, StopReason, ToolCallBlock};
use quorum_core::retry;
use quorum_core::stream::StreamEvent;

/// State machine for parsing OpenAI-compatible chat-completion chunks.
///
/// Tool-call arguments arrive as JSON fragments keyed by index; a call is
/// announced with `ToolCallStart` as soon as its id and name are known and
/// completed with `ToolCallEnd` once the stream finishes.
#[derive(Default)]
pub struct ChatStreamParser {
    started: bool,
    finished: bool,
    text: String,
    tool_blocks: Vec<ToolBlock>,
    finish_reason: Option<String>,
}

struct ToolBlock {
    index: u32,
    id: Option<String>,
    name: String,
    arguments_json: String,
    announced: bool,
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    error: Option<ChunkError>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChunkToolCall>,
}

#[derive(Deserialize)]
struct ChunkToolCall {
    #[serde(default)]
    index: u32,
    id: Option<String>,
    function: Option<ChunkFunction>,
}

#[derive(Deserialize)]
struct ChunkFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct ChunkError {
    #[serde(default)]
    message: String,
    #[serde(default, rename = "type")]
    error_type: Option<String>,
    #[serde(default)]
    code: Option<Value>,
}

impl ChatStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one `data:` payload and return zero or more StreamEvents.
    pub fn parse_data(&mut self, data: &str) -> Vec<StreamEvent> {
        let data = data.trim();
        if data == "[DONE]" {
            return self.finish();
        }
        if self.finished || data.is_empty() {
            return Vec::new();
        }

        let chunk: ChatChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(error = %e, "skipping unparseable stream chunk");
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        if !self.started {
            self.started = true;
            events.push(StreamEvent::Start);
        }

        if let Some(err) = chunk.error {
            self.finished = true;
            events.push(StreamEvent::Error {
                error: classify_error(&err),
            });
            return events;
        }

        for choice in chunk.choices {
            if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                self.text.push_str(&text);
                events.push(StreamEvent::TextDelta { delta: text });
            }

            for call in choice.delta.tool_calls {
                let block = self.block_for(call.index);
                if let Some(id) = call.id {
                    block.id = Some(id);
                }
                if let Some(function) = call.function {
                    if let Some(name) = function.name {
                        block.name.push_str(&name);
                    }
                    if let Some(args) = function.arguments {
                        block.arguments_json.push_str(&args);
                    }
                }
                if !block.announced && !block.name.is_empty() {
                    block.announced = true;
                    let id = block
                        .id
                        .get_or_insert_with(|| ToolCallId::new().to_string())
                        .clone();
                    events.push(StreamEvent::ToolCallStart {
                        tool_call_id: ToolCallId::from_raw(id),
                        name: block.name.clone(),
                    });
                }
            }

            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }
        }

        events
    }

    /// Close out the stream: complete every tool call and emit `Done`.
    /// Idempotent; a second call yields nothing.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut events = Vec::new();
        if !self.started {
            self.started = true;
            events.push(StreamEvent::Start);
        }

        let calls: Vec<ToolCallBlock> = self
            .tool_blocks
            .iter()
            .filter(|b| !b.name.is_empty())
            .map(|b| ToolCallBlock {
                id: b
                    .id
                    .as_deref()
                    .map(ToolCallId::from_raw)
                    .unwrap_or_default(),
                name: b.name.clone(),
                arguments: parse_arguments(&b.arguments_json),
            })
            .collect();

        for call in &calls {
            events.push(StreamEvent::ToolCallEnd {
                tool_call: call.clone(),
            });
        }

        let text = std::mem::take(&mut self.text);
        let message = AssistantMessage::with_tool_calls(Some(text), calls);
        let stop_reason = match self.finish_reason.as_deref() {
            Some("length") => StopReason::MaxTokens,
            Some("stop") if !message.has_tool_calls() => StopReason::EndTurn,
            _ if message.has_tool_calls() => StopReason::ToolUse,
            _ => StopReason::EndTurn,
        };
        events.push(StreamEvent::Done {
            message,
            stop_reason,
        });
        events
    }

    fn block_for(&mut self, index: u32) -> &mut ToolBlock {
        let pos = match self.tool_blocks.iter().position(|b| b.index == index) {
            Some(pos) => pos,
            None => {
                self.tool_blocks.push(ToolBlock {
                    index,
                    id: None,
                    name: String::new(),
                    arguments_json: String::new(),
                    announced: false,
                });
                self.tool_blocks.len() - 1
            }
        };
        &mut self.tool_blocks[pos]
    }
}

fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::json!({ "input": raw }))
}

fn classify_error(err: &ChunkError) -> GatewayError {
    let code = err.code.as_ref().map(|c| match c {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    });
    let marker = format!(
        "{} {} {}",
        err.error_type.as_deref().unwrap_or(""),
        code.as_deref().unwrap_or(""),
        err.message
    );
    if retry::is_rate_limit_error(&marker) {
        GatewayError::RateLimited {
            message: err.message.clone(),
            retry_after: retry::suggested_retry_after(&err.message),
        }
    } else {
        GatewayError::ServerError {
            status: 500,
            body: err.message.clone(),
        }
    }
}

/// Split raw SSE text into the `data` payload of each complete event.
/// Multi-line data is joined with `\n`; comments and other fields are
/// ignored.
pub fn parse_sse_data(raw: &str) -> Vec<String> {
    let mut payloads = Vec::new();
    let mut current: Option<String> = None;

    for line in raw.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            if let Some(data) = current.take() {
                payloads.push(data);
            }
        } else if let Some(data) = line.strip_prefix("data:") {
            let data = data.strip_prefix(' ').unwrap_or(data);
            match &mut current {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(data);
                }
                None => current = Some(data.to_string()),
            }
        }
    }

    // Handle trailing event without blank line
    if let Some(data) = current {
        payloads.push(data);
    }
    payloads
}
