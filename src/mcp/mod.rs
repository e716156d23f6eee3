//! Transport bridge to remote tool servers (JSON-RPC 2.0 over stdio).
//!
//! Wire payloads are `rmcp::model` types.

pub mod client;
pub mod connection;
pub mod protocol;
pub mod toolset;
pub mod transport;

pub use client::{into_value_or_text, text_content, ClientOptions, McpClient, McpConnectionState};
pub use connection::{ConnectionOptions, RpcConnection};
pub use protocol::RequestId;
pub use rmcp::model::{CallToolResult, InitializeResult, Tool as McpTool};
pub use toolset::{RemoteToolset, ToolsetConfig};
pub use transport::StdioServerParams;
