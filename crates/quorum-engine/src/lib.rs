pub mod error;
pub mod interceptor;
pub mod prompts;
pub mod queue;
pub mod registry;
pub mod runner;
pub mod specialist;
pub mod truncate;
pub mod workspace;

pub use error::EngineError;
pub use interceptor::{CallCounters, ToolInterceptor};
pub use queue::{
    tool_call_queue, ToolCallEvent, ToolCallReceiver, ToolCallSender, DEFAULT_QUEUE_CAPACITY,
    MIN_QUEUE_CAPACITY,
};
pub use registry::ToolRegistry;
pub use runner::{AgentRunner, AgentUpdate, RunnerConfig, UpdateStream};
pub use specialist::{AgentTool, LlmSpecialist, RemoteSpecialist, SpecialistAgent, OPERATION_ID_HEADER};
pub use workspace::{
    AnsweredQuestion, HttpWorkspace, InMemoryWorkspace, WorkspaceAction, WorkspaceBackend,
    WorkspaceError, WorkspaceTool, WORKSPACE_TOOL_NAME,
};
