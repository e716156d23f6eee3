//! Agent definition.

use std::sync::Arc;

use crate::agent_loop::AgentProfile;
use crate::mcp::ToolsetConfig;
use crate::tools::Tool;

/// What an agent is: its prompt, local tools and remote toolsets.
#[derive(Clone)]
pub struct Agent {
    name: String,
    description: String,
    instruction: Option<String>,
    tools: Vec<Arc<dyn Tool>>,
    toolsets: Vec<ToolsetConfig>,
    output_key: Option<String>,
}

impl Agent {
    /// Create a new agent.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            instruction: None,
            tools: Vec::new(),
            toolsets: Vec::new(),
            output_key: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// System prompt sent with every model request.
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }

    /// Add a local tool.
    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    pub fn with_tool_arc(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Add a remote toolset, connected when the runtime starts.
    pub fn with_toolset(mut self, toolset: ToolsetConfig) -> Self {
        self.toolsets.push(toolset);
        self
    }

    /// Store the final answer in session state under `key`.
    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn instruction(&self) -> Option<&str> {
        self.instruction.as_deref()
    }

    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    pub fn toolsets(&self) -> &[ToolsetConfig] {
        &self.toolsets
    }

    pub fn output_key(&self) -> Option<&str> {
        self.output_key.as_deref()
    }

    /// The part of the agent the orchestrator speaks with.
    pub fn profile(&self) -> AgentProfile {
        AgentProfile {
            name: self.name.clone(),
            instruction: self.instruction.clone(),
            output_key: self.output_key.clone(),
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("tools", &self.tools.iter().map(|t| t.name()).collect::<Vec<_>>())
            .field("toolsets", &self.toolsets.iter().map(|t| t.id.as_str()).collect::<Vec<_>>())
            .field("output_key", &self.output_key)
            .finish()
    }
}
