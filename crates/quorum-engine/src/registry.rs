use std::collections::HashMap;
use std::sync::Arc;

use quorum_core::tools::{Tool, ToolDefinition};

/// Tools available to one orchestrating agent run.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. A tool with the same name is replaced.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(Arc::clone)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// All tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Tool definitions for the LLM, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use quorum_core::tools::{ToolContext, ToolError, ToolResult};

    struct DummyTool {
        name: String,
    }

    impl DummyTool {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
            }
        }
    }

    #[async_trait]
    impl Tool for DummyTool {
        fn name(&self) -> &str {
            &self.name
        }
        fn description(&self) -> &str {
            "A dummy tool for testing"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(
            &self,
            _args: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<ToolResult, ToolError> {
            Ok(ToolResult::text("ok"))
        }
    }

    #[test]
    fn register_and_get() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DummyTool::new("market_analyst")));

        assert!(registry.contains("market_analyst"));
        assert!(!registry.contains("competitor_analyst"));
        assert_eq!(registry.count(), 1);
        assert!(registry.get("market_analyst").is_some());
    }

    #[test]
    fn same_name_replaces() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DummyTool::new("a")));
        registry.register(Arc::new(DummyTool::new("a")));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn names_and_definitions_sorted() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DummyTool::new("shared_workspace")));
        registry.register(Arc::new(DummyTool::new("location_scout")));
        registry.register(Arc::new(DummyTool::new("market_analyst")));

        assert_eq!(
            registry.names(),
            vec!["location_scout", "market_analyst", "shared_workspace"]
        );
        let defs = registry.definitions();
        assert_eq!(defs.len(), 3);
        assert_eq!(defs[0].name, "location_scout");
        assert_eq!(defs[2].name, "shared_workspace");
    }
}
