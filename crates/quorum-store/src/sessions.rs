use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use quorum_core::events::ToolCallPhase;
use quorum_core::ids::{OperationId, SessionId};

use crate::error::StoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// One intercepted tool-call phase, as recorded in a run's audit log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallLogEntry {
    pub phase: ToolCallPhase,
    pub tool_name: String,
    pub call_number: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args_preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_preview: Option<String>,
}

impl ToolCallLogEntry {
    /// Started entries in `log` with no matching completed entry, in start
    /// order, as `(tool_name, call_number)`.
    pub fn open_calls(log: &[ToolCallLogEntry]) -> Vec<(String, u32)> {
        log.iter()
            .filter(|e| e.phase == ToolCallPhase::Started)
            .filter(|s| {
                !log.iter().any(|c| {
                    c.phase == ToolCallPhase::Completed
                        && c.tool_name == s.tool_name
                        && c.call_number == s.call_number
                })
            })
            .map(|e| (e.tool_name.clone(), e.call_number))
            .collect()
    }
}

/// One completed unit of agent work. Immutable once appended.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent: String,
    pub content: String,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// One research request's lifecycle record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub operation_id: Option<OperationId>,
    pub results: Vec<AgentResult>,
    pub final_synthesis: Option<String>,
    pub error: Option<String>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, Session>,
    order: Vec<SessionId>,
}

/// In-memory registry of sessions.
///
/// Nothing is persisted: a process restart starts empty, and a session whose
/// run was interrupted by a crash stays `running` forever. Status only moves
/// forward (`pending → running → completed | failed`); each transition is
/// checked under the write lock, so a session can be started at most once.
#[derive(Default)]
pub struct SessionStore {
    inner: RwLock<Inner>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new pending session.
    #[instrument(skip(self, query, context))]
    pub fn create(&self, query: impl Into<String>, context: Option<Map<String, Value>>) -> Session {
        let session = Session {
            id: SessionId::new(),
            query: query.into(),
            context,
            status: SessionStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            operation_id: None,
            results: Vec::new(),
            final_synthesis: None,
            error: None,
        };

        let mut inner = self.inner.write();
        inner.order.push(session.id.clone());
        inner.sessions.insert(session.id.clone(), session.clone());
        debug!(session_id = %session.id, "session created");
        session
    }

    /// Get a session by ID.
    pub fn get(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.inner
            .read()
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// All sessions in creation order.
    pub fn list(&self) -> Vec<Session> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.sessions.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `pending → running`. Fails for any other current status, which is what
    /// makes a second `start` on the same session an error.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn mark_running(
        &self,
        id: &SessionId,
        operation_id: OperationId,
    ) -> Result<Session, StoreError> {
        self.transition(id, SessionStatus::Pending, |s| {
            s.status = SessionStatus::Running;
            s.started_at = Some(Utc::now());
            s.operation_id = Some(operation_id);
        })
    }

    /// Append a result to a running session.
    pub fn append_result(&self, id: &SessionId, result: AgentResult) -> Result<Session, StoreError> {
        self.transition(id, SessionStatus::Running, |s| s.results.push(result))
    }

    /// `running → completed`, recording the final synthesis.
    #[instrument(skip(self, synthesis), fields(session_id = %id))]
    pub fn mark_completed(
        &self,
        id: &SessionId,
        synthesis: impl Into<String>,
    ) -> Result<Session, StoreError> {
        let synthesis = synthesis.into();
        self.transition(id, SessionStatus::Running, |s| {
            s.status = SessionStatus::Completed;
            s.completed_at = Some(Utc::now());
            s.final_synthesis = Some(synthesis);
        })
    }

    /// `running → failed`, recording the error message.
    #[instrument(skip(self, error), fields(session_id = %id))]
    pub fn mark_failed(&self, id: &SessionId, error: impl Into<String>) -> Result<Session, StoreError> {
        let error = error.into();
        self.transition(id, SessionStatus::Running, |s| {
            s.status = SessionStatus::Failed;
            s.completed_at = Some(Utc::now());
            s.error = Some(error);
        })
    }

    fn transition(
        &self,
        id: &SessionId,
        expected: SessionStatus,
        apply: impl FnOnce(&mut Session),
    ) -> Result<Session, StoreError> {
        let mut inner = self.inner.write();
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if session.status != expected {
            return Err(StoreError::InvalidState {
                id: id.to_string(),
                expected,
                actual: session.status,
            });
        }
        apply(session);
        Ok(session.clone())
    }
}
