//! Client for a stdio tool server: handshake, discovery, calls, teardown.
//!
//! Payloads are `rmcp::model` types; [`RpcConnection`] owns the ids, the
//! pending map and the sequential queue.

use std::time::Duration;

use rmcp::model::{
    CallToolRequestParams, CallToolResult, ClientInfo, Content, InitializeResult, JsonObject,
    ListToolsResult, ProtocolVersion, Tool,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::{ConnectionOptions, RpcConnection};
use super::transport::StdioServerParams;
use crate::error::TurnloopError;

/// Upper bound on `tools/list` pages, guarding against cursor loops.
const MAX_LIST_PAGES: usize = 256;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpConnectionState {
    Initialized,
    Closed,
}

/// Timing knobs for one client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub label: String,
    pub sequential: bool,
    /// Budget for `initialize` (and for each discovery page).
    pub handshake_timeout: Duration,
    /// How long the process may take to exit after stdin closes.
    pub teardown_grace: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            label: "toolset".into(),
            sequential: false,
            handshake_timeout: Duration::from_secs(20),
            teardown_grace: Duration::from_secs(2),
        }
    }
}

/// An initialized client. Dropping it kills the server process.
pub struct McpClient {
    connection: RpcConnection,
    child: Mutex<Option<Child>>,
    server: InitializeResult,
    options: ClientOptions,
}

impl McpClient {
    /// Spawn the server and complete the `initialize` handshake.
    pub async fn spawn(params: &StdioServerParams, options: ClientOptions) -> Result<Self, TurnloopError> {
        let spawned = params.spawn(&options.label)?;
        let connection = RpcConnection::new(
            spawned.stdout,
            spawned.stdin,
            ConnectionOptions {
                label: options.label.clone(),
                sequential: options.sequential,
            },
        );
        Self::handshake(connection, Some(spawned.child), options).await
    }

    /// Handshake over an arbitrary stream pair (no process to manage).
    pub async fn connect<R, W>(reader: R, writer: W, options: ClientOptions) -> Result<Self, TurnloopError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let connection = RpcConnection::new(
            reader,
            writer,
            ConnectionOptions {
                label: options.label.clone(),
                sequential: options.sequential,
            },
        );
        Self::handshake(connection, None, options).await
    }

    async fn handshake(
        connection: RpcConnection,
        child: Option<Child>,
        options: ClientOptions,
    ) -> Result<Self, TurnloopError> {
        let child = Mutex::new(child);
        let server = match initialize(&connection, &options).await {
            Ok(server) => server,
            Err(err) => {
                teardown(&connection, &child, &options).await;
                return Err(handshake_error(&options.label, err));
            }
        };
        connection.notify("notifications/initialized", None)?;

        info!(
            toolset = %options.label,
            server = %server.server_info.name,
            protocol = ?server.protocol_version,
            "tool server initialized"
        );
        Ok(Self {
            connection,
            child,
            server,
            options,
        })
    }

    pub fn label(&self) -> &str {
        &self.options.label
    }

    pub fn server(&self) -> &InitializeResult {
        &self.server
    }

    /// Whether the server declared the `tools` capability.
    pub fn supports_tools(&self) -> bool {
        self.server.capabilities.tools.is_some()
    }

    pub fn state(&self) -> McpConnectionState {
        if self.connection.is_closed() {
            McpConnectionState::Closed
        } else {
            McpConnectionState::Initialized
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state() == McpConnectionState::Closed
    }

    /// Discover every tool, following `nextCursor` until exhausted.
    pub async fn list_tools(&self, cancel: &CancellationToken) -> Result<Vec<Tool>, TurnloopError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor
                .as_ref()
                .map(|cursor| serde_json::json!({ "cursor": cursor }));
            let reply = self
                .connection
                .request("tools/list", params, self.options.handshake_timeout, cancel)
                .await?;
            let page: ListToolsResult = serde_json::from_value(reply)?;
            debug!(toolset = %self.options.label, count = page.tools.len(), "discovered tool page");
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if Some(&next) != cursor.as_ref() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }
        Err(TurnloopError::Transport(format!(
            "{}: tools/list did not terminate after {MAX_LIST_PAGES} pages",
            self.options.label
        )))
    }

    /// Invoke one tool.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CallToolResult, TurnloopError> {
        let params = CallToolRequestParams {
            meta: None,
            name: name.to_owned().into(),
            arguments: coerce_arguments(name, arguments)?,
            task: None,
        };
        let reply = self
            .connection
            .request("tools/call", Some(serde_json::to_value(params)?), timeout, cancel)
            .await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// Stop sending, close stdin, wait for exit within the grace period,
    /// then kill. Safe to call more than once.
    pub async fn close(&self) {
        teardown(&self.connection, &self.child, &self.options).await;
    }
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("label", &self.options.label)
            .field("state", &self.state())
            .finish()
    }
}

/// Concatenated text parts of a call result, if any.
pub fn text_content(result: &CallToolResult) -> Option<String> {
    let lines: Vec<&str> = result
        .content
        .iter()
        .filter_map(|item| item.as_text().map(|text| text.text.as_str()))
        .collect();
    (!lines.is_empty()).then(|| lines.join("\n"))
}

/// Structured content when present, else text, else the raw content parts.
pub fn into_value_or_text(result: CallToolResult) -> serde_json::Value {
    if let Some(structured) = result.structured_content {
        return structured;
    }
    if let Some(text) = text_content(&result) {
        return serde_json::Value::String(text);
    }
    serde_json::Value::Array(
        result
            .content
            .iter()
            .filter_map(|item: &Content| serde_json::to_value(item).ok())
            .collect(),
    )
}

async fn initialize(
    connection: &RpcConnection,
    options: &ClientOptions,
) -> Result<InitializeResult, TurnloopError> {
    let mut info = ClientInfo {
        protocol_version: ProtocolVersion::V_2024_11_05,
        ..Default::default()
    };
    info.client_info.name = env!("CARGO_PKG_NAME").into();
    info.client_info.version = env!("CARGO_PKG_VERSION").into();

    let reply = connection
        .request(
            "initialize",
            Some(serde_json::to_value(info)?),
            options.handshake_timeout,
            &CancellationToken::new(),
        )
        .await?;
    Ok(serde_json::from_value(reply)?)
}

async fn teardown(connection: &RpcConnection, child: &Mutex<Option<Child>>, options: &ClientOptions) {
    if tokio::time::timeout(options.teardown_grace, connection.shutdown())
        .await
        .is_err()
    {
        warn!(toolset = %options.label, "outbound stream did not close in time");
    }

    let mut child = child.lock().await;
    if let Some(mut process) = child.take() {
        match tokio::time::timeout(options.teardown_grace, process.wait()).await {
            Ok(Ok(status)) => {
                debug!(toolset = %options.label, %status, "tool server exited");
            }
            Ok(Err(err)) => {
                warn!(toolset = %options.label, error = %err, "waiting for tool server failed");
            }
            Err(_) => {
                warn!(
                    toolset = %options.label,
                    grace_ms = options.teardown_grace.as_millis() as u64,
                    "tool server did not exit in time; killing"
                );
                if let Err(err) = process.kill().await {
                    warn!(toolset = %options.label, error = %err, "kill failed");
                }
            }
        }
    }
    connection.abort();
    info!(toolset = %options.label, "toolset closed");
}

/// Tool arguments travel as a JSON object; `null` means none.
fn coerce_arguments(name: &str, value: serde_json::Value) -> Result<Option<JsonObject>, TurnloopError> {
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Object(map) => Ok(Some(map)),
        other => Err(TurnloopError::invalid_arguments(
            name,
            format!("arguments must be a JSON object; got {other}"),
        )),
    }
}

fn handshake_error(label: &str, err: TurnloopError) -> TurnloopError {
    match err {
        TurnloopError::Transport(_) | TurnloopError::Spawn { .. } => err,
        other => TurnloopError::Transport(format!("{label}: initialize failed: {other}")),
    }
}
