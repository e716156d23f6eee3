//! Runtime-discovered tools hosted by a remote provider.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::arguments::ToolArguments;
use super::tool::{Tool, ToolContext};
use super::types::{ToolCapability, ToolParameters};
use crate::error::TurnloopError;

/// Something that can execute tools by name on behalf of the registry.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// Identifier of the toolset these tools belong to.
    fn toolset_id(&self) -> &str;

    /// Execute a tool by name.
    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, TurnloopError>;
}

/// A tool discovered at runtime.
#[derive(Debug, Clone)]
pub struct DiscoveredTool {
    pub name: String,
    pub description: String,
    pub parameters: ToolParameters,
    pub output_schema: Option<serde_json::Value>,
}

/// Exposes a [`DiscoveredTool`] through the [`Tool`] trait with
/// `Remote` capability.
pub struct RemoteTool {
    provider: Arc<dyn ToolProvider>,
    tool: DiscoveredTool,
    timeout: Option<Duration>,
}

impl RemoteTool {
    pub fn new(provider: Arc<dyn ToolProvider>, tool: DiscoveredTool) -> Self {
        Self {
            provider,
            tool,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Tool for RemoteTool {
    fn name(&self) -> &str {
        &self.tool.name
    }

    fn description(&self) -> &str {
        &self.tool.description
    }

    fn parameters(&self) -> &ToolParameters {
        &self.tool.parameters
    }

    fn output_schema(&self) -> Option<&serde_json::Value> {
        self.tool.output_schema.as_ref()
    }

    fn capability(&self) -> ToolCapability {
        ToolCapability::Remote {
            toolset_id: self.provider.toolset_id().to_string(),
        }
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn execute(
        &self,
        args: &ToolArguments,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, TurnloopError> {
        self.provider
            .call_tool(&self.tool.name, args.raw().clone(), ctx)
            .await
    }
}

impl std::fmt::Debug for RemoteTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTool")
            .field("name", &self.tool.name)
            .field("toolset", &self.provider.toolset_id())
            .finish()
    }
}
