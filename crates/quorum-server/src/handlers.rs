//! HTTP handlers for the session API.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::Json;
use futures::{Stream, StreamExt};
use quorum_core::ids::SessionId;
use quorum_store::{Session, SessionStatus};
use quorum_telemetry::{PollerConfig, TracePoller, TraceStore};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio_stream::wrappers::ReceiverStream;

use crate::error::ApiError;
use crate::event_bridge::{self, DEFAULT_EVENT_BUFFER};
use crate::orchestrator::ResearchOrchestrator;

/// Trace correlation wiring. Absent when no trace backend is configured.
#[derive(Clone)]
pub struct TraceSettings {
    pub store: Arc<dyn TraceStore>,
    pub poller: PollerConfig,
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ResearchOrchestrator>,
    pub traces: Option<TraceSettings>,
    pub event_buffer: usize,
}

impl AppState {
    pub fn new(orchestrator: Arc<ResearchOrchestrator>) -> Self {
        Self {
            orchestrator,
            traces: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    pub fn with_traces(mut self, store: Arc<dyn TraceStore>, poller: PollerConfig) -> Self {
        self.traces = Some(TraceSettings { store, poller });
        self
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub query: String,
    #[serde(default)]
    pub context: Option<Map<String, Value>>,
}

pub async fn create_session(
    State(state): State<AppState>,
    body: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    if request.query.trim().is_empty() {
        return Err(ApiError::BadRequest("query must not be empty".into()));
    }

    let session = state.orchestrator.store().create(request.query, request.context);
    tracing::info!(session_id = %session.id, "session created");
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "session_id": session.id,
            "status": session.status,
            "query": session.query,
            "created_at": session.created_at,
        })),
    ))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    let session = state.orchestrator.store().get(&SessionId::from_raw(id))?;
    Ok(Json(session))
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<Session>> {
    Json(state.orchestrator.store().list())
}

/// Start a pending session and stream its events as SSE.
///
/// The session is moved to `running` before the response is returned, so a
/// second start fails with 400 even while the first stream is still open.
pub async fn start_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let started = state.orchestrator.begin(&SessionId::from_raw(id))?;

    let poller = state.traces.as_ref().map(|traces| {
        TracePoller::new(
            Arc::clone(&traces.store),
            traces.poller.clone(),
            started.session_id.clone(),
            started.operation_id.clone(),
        )
    });
    let events = state.orchestrator.run(started);
    let rx = event_bridge::spawn_run(events, poller, state.event_buffer);

    let stream = ReceiverStream::new(rx).map(|event| Ok(event_bridge::sse_event(&event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

pub async fn cancel_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let id = SessionId::from_raw(id);
    if state.orchestrator.cancel(&id) {
        tracing::info!(session_id = %id, "cancellation requested");
        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "session_id": id, "status": SessionStatus::Running, "cancelled": true })),
        ));
    }
    let session = state.orchestrator.store().get(&id)?;
    Err(ApiError::Conflict(format!(
        "session {} is {}, not running",
        session.id, session.status
    )))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "sessions": state.orchestrator.store().len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::build_router;
    use crate::test_support::coffee_orchestrator;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use quorum_core::events::EventType;
    use tower::ServiceExt;

    fn app() -> axum::Router {
        let (orchestrator, _) = coffee_orchestrator();
        build_router(AppState::new(orchestrator))
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Parse an SSE body into `(event type, data json)` pairs.
    fn parse_frames(body: &str) -> Vec<(String, Value)> {
        body.split("\n\n")
            .filter_map(|block| {
                let mut kind = None;
                let mut data = None;
                for line in block.lines() {
                    if let Some(v) = line.strip_prefix("event:") {
                        kind = Some(v.trim().to_string());
                    } else if let Some(v) = line.strip_prefix("data:") {
                        data = serde_json::from_str(v.trim()).ok();
                    }
                }
                Some((kind?, data?))
            })
            .collect()
    }

    async fn create(app: &axum::Router, query: &str) -> String {
        let resp = app
            .clone()
            .oneshot(post_json("/sessions", json!({ "query": query })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        body_json(resp).await["session_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn create_returns_pending_session() {
        let app = app();
        let resp = app
            .clone()
            .oneshot(post_json(
                "/sessions",
                json!({ "query": "Coffee shop in Brno?", "context": { "budget": "200k" } }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "pending");
        assert_eq!(body["query"], "Coffee shop in Brno?");
        assert!(body["session_id"].as_str().unwrap().starts_with("sess_"));

        let id = body["session_id"].as_str().unwrap();
        let resp = app
            .oneshot(Request::get(format!("/sessions/{id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let session = body_json(resp).await;
        assert_eq!(session["context"]["budget"], "200k");
        assert_eq!(session["status"], "pending");
    }

    #[tokio::test]
    async fn create_rejects_bad_bodies() {
        let app = app();
        let resp = app
            .clone()
            .oneshot(post_json("/sessions", json!({ "query": "   " })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .clone()
            .oneshot(post_json("/sessions", json!({ "prompt": "wrong field" })))
            .await
            .unwrap();
        assert!(resp.status().is_client_error());

        let resp = app
            .oneshot(
                Request::post("/sessions")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(resp).await["error"].is_string());
    }

    #[tokio::test]
    async fn unknown_session_is_404() {
        let app = app();
        let resp = app
            .clone()
            .oneshot(Request::get("/sessions/sess_nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .clone()
            .oneshot(Request::post("/sessions/sess_nope/start").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .oneshot(Request::post("/sessions/sess_nope/cancel").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn start_streams_full_workflow() {
        let app = app();
        let id = create(&app, "Should I open a coffee shop in Brno?").await;

        let resp = app
            .clone()
            .oneshot(Request::post(format!("/sessions/{id}/start")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "text/event-stream");

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let frames = parse_frames(&String::from_utf8(bytes.to_vec()).unwrap());
        let kinds: Vec<&str> = frames.iter().map(|(k, _)| k.as_str()).collect();

        assert_eq!(kinds.first(), Some(&"session_started"));
        assert_eq!(kinds.last(), Some(&"workflow_completed"));
        assert_eq!(kinds.iter().filter(|k| k.starts_with("workflow_")).count(), 1);
        assert_eq!(kinds.iter().filter(|k| **k == "agent_thinking").count(), 2);
        assert_eq!(kinds.iter().filter(|k| **k == "agent_completed").count(), 2);
        for (kind, data) in &frames {
            assert_eq!(data["type"], kind.as_str());
            assert_eq!(data["session_id"], id.as_str());
        }

        let resp = app
            .clone()
            .oneshot(Request::get(format!("/sessions/{id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let session = body_json(resp).await;
        assert_eq!(session["status"], "completed");
        assert!(session["final_synthesis"]
            .as_str()
            .unwrap()
            .contains("Masarykova"));

        let resp = app
            .oneshot(Request::post(format!("/sessions/{id}/start")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn second_start_while_running_is_rejected() {
        let app = app();
        let id = create(&app, "q").await;

        let first = app
            .clone()
            .oneshot(Request::post(format!("/sessions/{id}/start")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .clone()
            .oneshot(Request::post(format!("/sessions/{id}/start")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::BAD_REQUEST);

        // The first stream is unaffected.
        let bytes = first.into_body().collect().await.unwrap().to_bytes();
        let frames = parse_frames(&String::from_utf8(bytes.to_vec()).unwrap());
        assert_eq!(frames.last().unwrap().0, EventType::WorkflowCompleted.as_str());
    }

    #[tokio::test]
    async fn cancel_requires_running_session() {
        let app = app();
        let id = create(&app, "q").await;
        let resp = app
            .oneshot(Request::post(format!("/sessions/{id}/cancel")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn list_and_health() {
        let app = app();
        create(&app, "one").await;
        create(&app, "two").await;

        let resp = app
            .clone()
            .oneshot(Request::get("/sessions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(resp).await.as_array().unwrap().len(), 2);

        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["sessions"], 2);
    }
}
