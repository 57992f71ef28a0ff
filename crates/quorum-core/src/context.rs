use crate::messages::Message;
use crate::tools::ToolDefinition;

/// The complete context sent to a provider for one round trip.
#[derive(Clone, Debug, Default)]
pub struct LlmContext {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

impl LlmContext {
    /// Create an empty context (useful for testing).
    pub fn empty() -> Self {
        Self::default()
    }

    /// A single-turn context: system prompt plus one user message, no tools.
    pub fn single(system_prompt: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            messages: vec![Message::user_text(user)],
            tools: Vec::new(),
        }
    }
}
