//! Session-scoped shared workspace ("scratchpad") that agents use to pass
//! intermediate findings and open questions to each other.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::instrument;

use quorum_core::ids::SessionId;
use quorum_core::tools::{Tool, ToolContext, ToolError, ToolResult};

pub const WORKSPACE_TOOL_NAME: &str = "shared_workspace";

/// Header scoping every workspace request to one session.
pub const SESSION_HEADER: &str = "X-Session-Id";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("workspace transport error: {0}")]
    Transport(String),
    #[error("workspace returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed workspace response: {0}")]
    Malformed(String),
    #[error("invalid workspace url: {0}")]
    InvalidUrl(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnsweredQuestion {
    pub id: String,
    pub question: String,
    pub answer: String,
}

#[async_trait]
pub trait WorkspaceBackend: Send + Sync {
    async fn write_section(
        &self,
        session: &SessionId,
        section: &str,
        content: &str,
    ) -> Result<(), WorkspaceError>;

    async fn read_section(
        &self,
        session: &SessionId,
        section: &str,
    ) -> Result<Option<String>, WorkspaceError>;

    async fn list_sections(&self, session: &SessionId) -> Result<Vec<String>, WorkspaceError>;

    /// Record a question for a human; returns its id.
    async fn add_question(&self, session: &SessionId, question: &str)
        -> Result<String, WorkspaceError>;

    async fn get_answered_questions(
        &self,
        session: &SessionId,
    ) -> Result<Vec<AnsweredQuestion>, WorkspaceError>;
}

#[derive(Clone, Debug)]
struct Question {
    id: String,
    text: String,
    answer: Option<String>,
}

#[derive(Default)]
struct Pad {
    sections: BTreeMap<String, String>,
    questions: Vec<Question>,
}

/// Process-local workspace.
#[derive(Default)]
pub struct InMemoryWorkspace {
    pads: RwLock<HashMap<SessionId, Pad>>,
}

impl InMemoryWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer a previously added question. Returns false if no such question.
    pub fn answer_question(&self, session: &SessionId, id: &str, answer: impl Into<String>) -> bool {
        let mut pads = self.pads.write();
        let Some(q) = pads
            .get_mut(session)
            .and_then(|p| p.questions.iter_mut().find(|q| q.id == id))
        else {
            return false;
        };
        q.answer = Some(answer.into());
        true
    }
}

#[async_trait]
impl WorkspaceBackend for InMemoryWorkspace {
    async fn write_section(
        &self,
        session: &SessionId,
        section: &str,
        content: &str,
    ) -> Result<(), WorkspaceError> {
        self.pads
            .write()
            .entry(session.clone())
            .or_default()
            .sections
            .insert(section.to_string(), content.to_string());
        Ok(())
    }

    async fn read_section(
        &self,
        session: &SessionId,
        section: &str,
    ) -> Result<Option<String>, WorkspaceError> {
        Ok(self
            .pads
            .read()
            .get(session)
            .and_then(|p| p.sections.get(section).cloned()))
    }

    async fn list_sections(&self, session: &SessionId) -> Result<Vec<String>, WorkspaceError> {
        Ok(self
            .pads
            .read()
            .get(session)
            .map(|p| p.sections.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn add_question(
        &self,
        session: &SessionId,
        question: &str,
    ) -> Result<String, WorkspaceError> {
        let mut pads = self.pads.write();
        let pad = pads.entry(session.clone()).or_default();
        let id = format!("q{}", pad.questions.len() + 1);
        pad.questions.push(Question {
            id: id.clone(),
            text: question.to_string(),
            answer: None,
        });
        Ok(id)
    }

    async fn get_answered_questions(
        &self,
        session: &SessionId,
    ) -> Result<Vec<AnsweredQuestion>, WorkspaceError> {
        Ok(self
            .pads
            .read()
            .get(session)
            .map(|p| {
                p.questions
                    .iter()
                    .filter_map(|q| {
                        q.answer.as_ref().map(|a| AnsweredQuestion {
                            id: q.id.clone(),
                            question: q.text.clone(),
                            answer: a.clone(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Workspace served over HTTP.
///
/// Routes under `base_url`: `PUT /sections/{name}`, `GET /sections/{name}`,
/// `GET /sections`, `POST /questions`, `GET /questions?status=answered`.
/// Section names are sent as a single percent-encoded path segment.
pub struct HttpWorkspace {
    client: Client,
    base_url: Url,
}

#[derive(Deserialize)]
struct SectionBody {
    content: String,
}

#[derive(Deserialize)]
struct SectionList {
    sections: Vec<String>,
}

#[derive(Deserialize)]
struct QuestionCreated {
    id: String,
}

#[derive(Deserialize)]
struct QuestionList {
    questions: Vec<AnsweredQuestion>,
}

impl HttpWorkspace {
    pub fn new(base_url: impl Into<String>) -> Result<Self, WorkspaceError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| WorkspaceError::Transport(e.to_string()))?;
        let base_url = Url::parse(&base_url.into())
            .map_err(|e| WorkspaceError::InvalidUrl(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(WorkspaceError::InvalidUrl(base_url.to_string()));
        }
        Ok(Self { client, base_url })
    }

    /// `base_url` extended by `segments`, each encoded as one path segment.
    fn url(&self, segments: &[&str]) -> Result<Url, WorkspaceError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| WorkspaceError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(
        &self,
        req: reqwest::RequestBuilder,
        session: &SessionId,
    ) -> Result<reqwest::Response, WorkspaceError> {
        req.header(SESSION_HEADER, session.as_str())
            .send()
            .await
            .map_err(|e| WorkspaceError::Transport(e.to_string()))
    }

    async fn expect_success(resp: reqwest::Response) -> Result<reqwest::Response, WorkspaceError> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(WorkspaceError::Status { status, body })
    }

    async fn json<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, WorkspaceError> {
        resp.json()
            .await
            .map_err(|e| WorkspaceError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl WorkspaceBackend for HttpWorkspace {
    #[instrument(skip(self, content), fields(session_id = %session))]
    async fn write_section(
        &self,
        session: &SessionId,
        section: &str,
        content: &str,
    ) -> Result<(), WorkspaceError> {
        let req = self
            .client
            .put(self.url(&["sections", section])?)
            .json(&json!({ "content": content }));
        Self::expect_success(self.send(req, session).await?).await?;
        Ok(())
    }

    async fn read_section(
        &self,
        session: &SessionId,
        section: &str,
    ) -> Result<Option<String>, WorkspaceError> {
        let req = self.client.get(self.url(&["sections", section])?);
        let resp = self.send(req, session).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: SectionBody = Self::json(Self::expect_success(resp).await?).await?;
        Ok(Some(body.content))
    }

    async fn list_sections(&self, session: &SessionId) -> Result<Vec<String>, WorkspaceError> {
        let req = self.client.get(self.url(&["sections"])?);
        let list: SectionList = Self::json(Self::expect_success(self.send(req, session).await?).await?).await?;
        Ok(list.sections)
    }

    async fn add_question(
        &self,
        session: &SessionId,
        question: &str,
    ) -> Result<String, WorkspaceError> {
        let req = self
            .client
            .post(self.url(&["questions"])?)
            .json(&json!({ "question": question }));
        let created: QuestionCreated =
            Self::json(Self::expect_success(self.send(req, session).await?).await?).await?;
        Ok(created.id)
    }

    async fn get_answered_questions(
        &self,
        session: &SessionId,
    ) -> Result<Vec<AnsweredQuestion>, WorkspaceError> {
        let req = self
            .client
            .get(self.url(&["questions"])?)
            .query(&[("status", "answered")]);
        let list: QuestionList =
            Self::json(Self::expect_success(self.send(req, session).await?).await?).await?;
        Ok(list.questions)
    }
}

/// Workspace operations offered to the orchestrating agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkspaceAction {
    WriteSection,
    ReadSection,
    ListSections,
    AddQuestion,
    GetAnsweredQuestions,
}

impl WorkspaceAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "write_section" => Some(Self::WriteSection),
            "read_section" => Some(Self::ReadSection),
            "list_sections" => Some(Self::ListSections),
            "add_question" => Some(Self::AddQuestion),
            "get_answered_questions" => Some(Self::GetAnsweredQuestions),
            _ => None,
        }
    }

    /// Action named by a workspace tool call's arguments.
    pub fn from_args(args: &Value) -> Option<Self> {
        args["action"].as_str().and_then(Self::parse)
    }
}

/// The shared workspace as a single tool with an `action` argument. The
/// session comes from the calling run's [`ToolContext`].
pub struct WorkspaceTool {
    backend: Arc<dyn WorkspaceBackend>,
}

impl WorkspaceTool {
    pub fn new(backend: Arc<dyn WorkspaceBackend>) -> Self {
        Self { backend }
    }
}

fn required<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolResult> {
    args[key]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolResult::error(format!("{key} is required")))
}

fn backend_failure(e: WorkspaceError) -> ToolError {
    ToolError::ExecutionFailed(e.to_string())
}

#[async_trait]
impl Tool for WorkspaceTool {
    fn name(&self) -> &str {
        WORKSPACE_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Shared scratchpad for this research session. Write findings into named \
         sections, read them back, list sections, ask the user a question, and \
         fetch questions the user has answered."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["action"],
            "properties": {
                "action": {
                    "type": "string",
                    "enum": [
                        "write_section",
                        "read_section",
                        "list_sections",
                        "add_question",
                        "get_answered_questions"
                    ]
                },
                "section": {
                    "type": "string",
                    "description": "Section name (write_section, read_section)"
                },
                "content": {
                    "type": "string",
                    "description": "Section content (write_section)"
                },
                "question": {
                    "type": "string",
                    "description": "Question for the user (add_question)"
                }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let Some(action) = WorkspaceAction::from_args(&args) else {
            return Ok(ToolResult::error(format!(
                "unknown action: {}",
                args["action"].as_str().unwrap_or("<missing>")
            )));
        };
        let session = &ctx.session_id;

        let result = match action {
            WorkspaceAction::WriteSection => {
                let (section, content) = match (required(&args, "section"), required(&args, "content")) {
                    (Ok(s), Ok(c)) => (s, c),
                    (Err(r), _) | (_, Err(r)) => return Ok(r),
                };
                self.backend
                    .write_section(session, section, content)
                    .await
                    .map_err(backend_failure)?;
                ToolResult::text(format!("Section '{section}' saved."))
            }
            WorkspaceAction::ReadSection => {
                let section = match required(&args, "section") {
                    Ok(s) => s,
                    Err(r) => return Ok(r),
                };
                match self
                    .backend
                    .read_section(session, section)
                    .await
                    .map_err(backend_failure)?
                {
                    Some(content) => ToolResult::text(content),
                    None => ToolResult::text(format!("Section '{section}' is empty.")),
                }
            }
            WorkspaceAction::ListSections => {
                let sections = self
                    .backend
                    .list_sections(session)
                    .await
                    .map_err(backend_failure)?;
                if sections.is_empty() {
                    ToolResult::text("No sections yet.")
                } else {
                    ToolResult::text(sections.join("\n"))
                }
            }
            WorkspaceAction::AddQuestion => {
                let question = match required(&args, "question") {
                    Ok(q) => q,
                    Err(r) => return Ok(r),
                };
                let id = self
                    .backend
                    .add_question(session, question)
                    .await
                    .map_err(backend_failure)?;
                ToolResult::text(format!("Question {id} recorded."))
            }
            WorkspaceAction::GetAnsweredQuestions => {
                let answered = self
                    .backend
                    .get_answered_questions(session)
                    .await
                    .map_err(backend_failure)?;
                if answered.is_empty() {
                    ToolResult::text("No answered questions.")
                } else {
                    let lines: Vec<String> = answered
                        .iter()
                        .map(|q| format!("{} {}\n-> {}", q.id, q.question, q.answer))
                        .collect();
                    ToolResult::text(lines.join("\n"))
                }
            }
        };
        Ok(result)
    }
}
