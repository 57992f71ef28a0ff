//! System prompts for the orchestrating agent.

use quorum_core::tools::ToolDefinition;

use crate::workspace::WORKSPACE_TOOL_NAME;

const BASE_PROMPT: &str = "\
You coordinate a team of specialist agents to answer one research request.

Each specialist is a tool that takes a single free-text `input`. Call any
specialist as often as you need and in any order; ask follow-up questions
when an answer is thin or contradicts another. When you have enough, write
the final answer yourself: a structured synthesis with a clear
recommendation, the evidence behind it, and the main risks.";

const WORKSPACE_PROMPT: &str = "\
A shared workspace is available through the `shared_workspace` tool.
Record each specialist's key findings in a named section with
`write_section` as you go, read sections back before synthesizing, and use
`add_question` when you need information only the user can provide. Check
`get_answered_questions` before finishing.";

/// Prompt for the orchestrating agent given the tools of this run.
///
/// The variant differs only in whether the shared workspace is described.
pub fn orchestrator_prompt(tools: &[ToolDefinition]) -> String {
    let has_workspace = tools.iter().any(|t| t.name == WORKSPACE_TOOL_NAME);
    let specialists: Vec<String> = tools
        .iter()
        .filter(|t| t.name != WORKSPACE_TOOL_NAME)
        .map(|t| format!("- {}: {}", t.name, t.description))
        .collect();

    let mut prompt = String::from(BASE_PROMPT);
    if !specialists.is_empty() {
        prompt.push_str("\n\nAvailable specialists:\n");
        prompt.push_str(&specialists.join("\n"));
    }
    if has_workspace {
        prompt.push_str("\n\n");
        prompt.push_str(WORKSPACE_PROMPT);
    }
    prompt
}
