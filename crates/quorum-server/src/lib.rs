pub mod error;
pub mod event_bridge;
pub mod handlers;
pub mod orchestrator;
pub mod server;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::ApiError;
pub use event_bridge::{frame, spawn_run, DEFAULT_EVENT_BUFFER};
pub use handlers::{AppState, TraceSettings};
pub use orchestrator::{OrchestratorConfig, ResearchOrchestrator, StartedRun, ORCHESTRATOR_AGENT};
pub use server::{build_router, start, ServerConfig, ServerHandle};
