//! Parsed records from the external telemetry store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::trace_store::QueryTable;

/// Which table a record came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Trace,
    Dependency,
    Request,
}

impl RecordKind {
    fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "dependency" | "dependencies" | "appdependencies" => Self::Dependency,
            "request" | "requests" | "apprequests" => Self::Request,
            _ => Self::Trace,
        }
    }
}

/// One span as reported by the store. Deduplicated by `span_id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub operation_id: String,
    pub span_id: String,
    pub parent_id: Option<String>,
    pub duration_ms: Option<f64>,
    pub success: Option<bool>,
    pub attributes: Map<String, Value>,
    pub kind: RecordKind,
}

const AGENT_NAME_KEYS: &[&str] = &["gen_ai.agent.name", "agent_name", "agent.name"];
const TOOL_NAME_KEYS: &[&str] = &["gen_ai.tool.name", "tool_name", "tool.name"];
const MCP_SERVER_KEYS: &[&str] = &["mcp.server", "mcp_server", "gen_ai.mcp.server", "server.address"];
const ADMIN_MARKERS: &[&str] = &[
    "health",
    "healthz",
    "healthcheck",
    "heartbeat",
    "ping",
    "liveness",
    "readiness",
];

impl TraceEvent {
    /// Parse one row of a query result. Rows without a timestamp or span id
    /// cannot be ordered or deduplicated and yield `None`.
    pub fn from_row(table: &QueryTable, row: &[Value]) -> Option<Self> {
        let cell = |name: &str| -> Option<&Value> {
            let idx = table.column_index(name)?;
            row.get(idx).filter(|v| !v.is_null())
        };

        let timestamp = cell("timestamp")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())?
            .with_timezone(&Utc);
        let span_id = cell("span_id").and_then(as_string).filter(|s| !s.is_empty())?;

        Some(Self {
            timestamp,
            name: cell("name").and_then(as_string).unwrap_or_default(),
            operation_id: cell("operation_id").and_then(as_string).unwrap_or_default(),
            span_id,
            parent_id: cell("parent_id").and_then(as_string).filter(|s| !s.is_empty()),
            duration_ms: cell("duration_ms").and_then(as_f64),
            success: cell("success").and_then(as_bool),
            attributes: cell("custom_dimensions").map(as_map).unwrap_or_default(),
            kind: cell("item_type")
                .and_then(Value::as_str)
                .map(RecordKind::parse)
                .unwrap_or(RecordKind::Trace),
        })
    }

    fn attr(&self, keys: &[&str]) -> Option<String> {
        keys.iter()
            .find_map(|k| self.attributes.get(*k).and_then(as_string))
            .filter(|s| !s.is_empty())
    }

    fn operation_name(&self) -> Option<String> {
        self.attr(&["gen_ai.operation.name"])
    }

    fn name_suffix(&self, prefix: &str) -> Option<String> {
        self.name
            .strip_prefix(prefix)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    pub fn is_agent_invocation(&self) -> bool {
        self.operation_name().as_deref() == Some("invoke_agent")
            || self.name.starts_with("invoke_agent")
            || (self.attr(AGENT_NAME_KEYS).is_some() && !self.is_tool_call())
    }

    pub fn is_tool_call(&self) -> bool {
        self.operation_name().as_deref() == Some("execute_tool")
            || self.name.starts_with("execute_tool")
            || self.attr(TOOL_NAME_KEYS).is_some()
            || self.mcp_server().is_some()
    }

    pub fn agent_name(&self) -> Option<String> {
        self.attr(AGENT_NAME_KEYS)
            .or_else(|| self.name_suffix("invoke_agent"))
    }

    pub fn tool_name(&self) -> Option<String> {
        self.attr(TOOL_NAME_KEYS)
            .or_else(|| self.name_suffix("execute_tool"))
    }

    pub fn mcp_server(&self) -> Option<String> {
        self.attr(MCP_SERVER_KEYS)
    }

    /// Health checks, heartbeats and pings that carry no workflow meaning.
    /// Markers must be whole words of the span name; tool calls and agent
    /// invocations are never administrative.
    pub fn is_administrative(&self) -> bool {
        if self.is_tool_call() || self.is_agent_invocation() {
            return false;
        }
        let lower = self.name.to_ascii_lowercase();
        lower
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|word| ADMIN_MARKERS.contains(&word))
    }

    /// A span whose duration is known has finished.
    pub fn is_complete(&self) -> bool {
        self.duration_ms.is_some()
    }
}

fn as_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        _ => None,
    }
}

/// Custom dimensions arrive either as an object or as a JSON-encoded string.
fn as_map(v: &Value) -> Map<String, Value> {
    match v {
        Value::Object(map) => map.clone(),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        },
        _ => Map::new(),
    }
}
