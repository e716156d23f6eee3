//! Tool system: definitions, validation, registry and remote adapters.

pub mod arguments;
pub mod dynamic;
pub mod registry;
pub mod tool;
pub mod types;
pub mod validation;

pub use arguments::ToolArguments;
pub use dynamic::{DiscoveredTool, RemoteTool, ToolProvider};
pub use registry::ToolRegistry;
pub use tool::{FunctionTool, Tool, ToolActions, ToolContext};
pub use types::{ParameterBuilder, ToolCapability, ToolDefinition, ToolParameters};
