use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::SessionId;

/// Closed vocabulary of the streaming protocol.
///
/// The payload shape of each type is a versioned contract with clients; the
/// `trace_*` and `heartbeat` types come only from the trace poller and are
/// not needed for UI correctness.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionStarted,
    AgentStarted,
    AgentProgress,
    AgentThinking,
    AgentCompleted,
    AgentFailed,
    SynthesisStarted,
    SynthesisProgress,
    SynthesisCompleted,
    WorkflowCompleted,
    WorkflowFailed,
    QuestionAdded,
    AwaitingUserInput,
    QuestionsAnswered,
    ScratchpadUpdated,
    ScratchpadSnapshot,
    TraceSpanStarted,
    TraceSpanCompleted,
    TraceToolCall,
    Heartbeat,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStarted => "session_started",
            Self::AgentStarted => "agent_started",
            Self::AgentProgress => "agent_progress",
            Self::AgentThinking => "agent_thinking",
            Self::AgentCompleted => "agent_completed",
            Self::AgentFailed => "agent_failed",
            Self::SynthesisStarted => "synthesis_started",
            Self::SynthesisProgress => "synthesis_progress",
            Self::SynthesisCompleted => "synthesis_completed",
            Self::WorkflowCompleted => "workflow_completed",
            Self::WorkflowFailed => "workflow_failed",
            Self::QuestionAdded => "question_added",
            Self::AwaitingUserInput => "awaiting_user_input",
            Self::QuestionsAnswered => "questions_answered",
            Self::ScratchpadUpdated => "scratchpad_updated",
            Self::ScratchpadSnapshot => "scratchpad_snapshot",
            Self::TraceSpanStarted => "trace_span_started",
            Self::TraceSpanCompleted => "trace_span_completed",
            Self::TraceToolCall => "trace_tool_call",
            Self::Heartbeat => "heartbeat",
        }
    }

    /// `workflow_completed` or `workflow_failed`: the last event of a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::WorkflowCompleted | Self::WorkflowFailed)
    }

    /// Produced by the trace poller rather than the orchestrator.
    pub fn is_observability(&self) -> bool {
        matches!(
            self,
            Self::TraceSpanStarted | Self::TraceSpanCompleted | Self::TraceToolCall | Self::Heartbeat
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of one intercepted tool invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallPhase {
    Started,
    Completed,
}

impl ToolCallPhase {
    /// The client-facing event a phase is reported as.
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Started => EventType::AgentThinking,
            Self::Completed => EventType::AgentCompleted,
        }
    }
}

/// One unit of the streaming protocol. Always belongs to exactly one session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl Event {
    /// Build an event stamped with the current time. `data` should be a JSON
    /// object; anything else is wrapped as `{"value": data}`.
    pub fn new(event_type: EventType, session_id: &SessionId, data: Value) -> Self {
        let data = match data {
            Value::Object(_) => data,
            Value::Null => Value::Object(Default::default()),
            other => serde_json::json!({ "value": other }),
        };
        Self {
            event_type,
            session_id: session_id.clone(),
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_type_wire_names_match_serde() {
        let all = [
            EventType::SessionStarted,
            EventType::AgentThinking,
            EventType::WorkflowFailed,
            EventType::ScratchpadSnapshot,
            EventType::TraceToolCall,
            EventType::Heartbeat,
        ];
        for t in all {
            let json = serde_json::to_value(t).unwrap();
            assert_eq!(json, t.as_str());
        }
    }

    #[test]
    fn terminal_classification() {
        assert!(EventType::WorkflowCompleted.is_terminal());
        assert!(EventType::WorkflowFailed.is_terminal());
        assert!(!EventType::SynthesisCompleted.is_terminal());
        assert!(!EventType::AgentFailed.is_terminal());
    }

    #[test]
    fn observability_classification() {
        assert!(EventType::TraceSpanStarted.is_observability());
        assert!(EventType::Heartbeat.is_observability());
        assert!(!EventType::AgentThinking.is_observability());
    }

    #[test]
    fn tool_call_phases_map_to_agent_events() {
        assert_eq!(ToolCallPhase::Started.event_type(), EventType::AgentThinking);
        assert_eq!(ToolCallPhase::Completed.event_type(), EventType::AgentCompleted);
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let sid = SessionId::from_raw("sess_1");
        let evt = Event::new(EventType::AgentProgress, &sid, json!({"content": "hi"}));
        let v = serde_json::to_value(&evt).unwrap();
        assert_eq!(v["type"], "agent_progress");
        assert_eq!(v["session_id"], "sess_1");
        assert_eq!(v["data"]["content"], "hi");
        assert!(v["timestamp"].is_string());
    }

    #[test]
    fn non_object_payload_is_wrapped() {
        let sid = SessionId::new();
        assert_eq!(Event::new(EventType::Heartbeat, &sid, json!(3)).data, json!({"value": 3}));
        assert_eq!(Event::new(EventType::Heartbeat, &sid, Value::Null).data, json!({}));
    }
}
