//! Fixtures shared by the server's unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use quorum_core::events::{Event, EventType};
use quorum_core::tools::{ToolContext, ToolError};
use quorum_engine::SpecialistAgent;
use quorum_llm::{MockProvider, MockResponse};
use quorum_store::SessionStore;

use crate::orchestrator::ResearchOrchestrator;

/// Specialist with a fixed reply.
pub struct Scripted {
    name: &'static str,
    reply: Result<String, String>,
}

impl Scripted {
    pub fn ok(name: &'static str, reply: &str) -> Self {
        Self { name, reply: Ok(reply.into()) }
    }

    pub fn failing(name: &'static str, error: &str) -> Self {
        Self { name, reply: Err(error.into()) }
    }
}

#[async_trait]
impl SpecialistAgent for Scripted {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "scripted specialist"
    }

    async fn run(&self, _input: &str, _ctx: &ToolContext) -> Result<String, ToolError> {
        self.reply.clone().map_err(ToolError::ExecutionFailed)
    }
}

/// Orchestrator that consults two specialists, one per turn, then answers.
pub fn coffee_orchestrator() -> (Arc<ResearchOrchestrator>, Arc<MockProvider>) {
    let provider = Arc::new(MockProvider::new(vec![
        MockResponse::tool_call("market_analyst", "foot traffic and demand in Brno"),
        MockResponse::tool_call("location_scout", "rent near Masarykova"),
        MockResponse::stream_chunks(&[
            "Demand is strong near the university. ",
            "Rent near Masarykova is high but justified.",
        ]),
    ]));
    let orchestrator = ResearchOrchestrator::new(
        Arc::new(SessionStore::new()),
        provider.clone(),
        vec![
            Arc::new(Scripted::ok("market_analyst", "Strong student demand, 3 competitors.")),
            Arc::new(Scripted::ok("location_scout", "Average rent 450 CZK/m2.")),
        ],
    );
    (Arc::new(orchestrator), provider)
}

pub fn types(events: &[Event]) -> Vec<EventType> {
    events.iter().map(|e| e.event_type).collect()
}
