use quorum_core::errors::GatewayError;
use quorum_core::tools::ToolError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("agent aborted")]
    Aborted,

    #[error("max turns exceeded: {0}")]
    MaxTurnsExceeded(u32),

    #[error("{0}")]
    Internal(String),
}
