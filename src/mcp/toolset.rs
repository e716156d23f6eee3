//! Remote toolsets: a server process whose tools live in the registry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use rmcp::model::Tool;

use super::client::{into_value_or_text, text_content, ClientOptions, McpClient};
use super::transport::StdioServerParams;
use crate::config::RuntimeConfig;
use crate::error::TurnloopError;
use crate::tools::{DiscoveredTool, RemoteTool, ToolContext, ToolParameters, ToolProvider, ToolRegistry};
use crate::util::with_timeout;

/// How to start and expose one remote toolset.
#[derive(Debug, Clone)]
pub struct ToolsetConfig {
    pub id: String,
    pub params: StdioServerParams,
    /// Only tools with these names are registered when set.
    pub tool_filter: Option<Vec<String>>,
    /// Per-call budget; falls back to the runtime tool timeout.
    pub call_timeout: Option<Duration>,
    /// The server handles one request at a time.
    pub sequential: bool,
}

impl ToolsetConfig {
    pub fn new(id: impl Into<String>, params: StdioServerParams) -> Self {
        Self {
            id: id.into(),
            params,
            tool_filter: None,
            call_timeout: None,
            sequential: false,
        }
    }

    pub fn with_tool_filter<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tool_filter = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_sequential(mut self, sequential: bool) -> Self {
        self.sequential = sequential;
        self
    }

    fn admits(&self, name: &str) -> bool {
        self.tool_filter
            .as_ref()
            .map_or(true, |allowed| allowed.iter().any(|n| n == name))
    }
}

/// One live connection; the provider behind every registered remote tool.
struct ToolsetSession {
    id: String,
    client: McpClient,
    call_timeout: Duration,
}

#[async_trait]
impl ToolProvider for ToolsetSession {
    fn toolset_id(&self) -> &str {
        &self.id
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, TurnloopError> {
        let result = self
            .client
            .call_tool(name, arguments, self.call_timeout, ctx.cancellation())
            .await?;
        if result.is_error.unwrap_or(false) {
            let message = text_content(&result)
                .or_else(|| result.structured_content.as_ref().map(|v| v.to_string()))
                .unwrap_or_else(|| "remote tool reported an error".to_string());
            return Err(TurnloopError::execution_message(name, message));
        }
        Ok(into_value_or_text(result))
    }
}

/// A connected remote toolset.
///
/// The tool catalogue is discovered once per connection and stays valid
/// until [`RemoteToolset::reconnect`] or [`RemoteToolset::close`].
pub struct RemoteToolset {
    config: ToolsetConfig,
    runtime: RuntimeConfig,
    registry: Arc<ToolRegistry>,
    session: Mutex<Option<Arc<ToolsetSession>>>,
}

impl RemoteToolset {
    /// Spawn, initialize and discover, registering the admitted tools.
    /// The whole sequence is bounded by the handshake timeout.
    pub async fn connect(
        config: ToolsetConfig,
        registry: Arc<ToolRegistry>,
        runtime: &RuntimeConfig,
    ) -> Result<Self, TurnloopError> {
        let toolset = Self {
            config,
            runtime: runtime.clone(),
            registry,
            session: Mutex::new(None),
        };
        let session = toolset.open().await?;
        *toolset.session.lock().await = Some(session);
        Ok(toolset)
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &ToolsetConfig {
        &self.config
    }

    /// Names of the tools registered by the current connection.
    pub fn tool_names(&self) -> Vec<String> {
        self.registry
            .definitions()
            .into_iter()
            .filter(|def| def.capability.toolset_id() == Some(self.id()))
            .map(|def| def.name)
            .collect()
    }

    pub async fn is_connected(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|session| !session.client.is_closed())
    }

    /// Tear down and start over with a fresh catalogue.
    pub async fn reconnect(&self) -> Result<(), TurnloopError> {
        let mut slot = self.session.lock().await;
        if let Some(old) = slot.take() {
            self.teardown(&old).await;
        }
        *slot = Some(self.open().await?);
        info!(toolset = %self.config.id, "toolset reconnected");
        Ok(())
    }

    /// Unregister the tools and stop the server process.
    pub async fn close(&self) {
        if let Some(session) = self.session.lock().await.take() {
            self.teardown(&session).await;
        }
    }

    async fn teardown(&self, session: &ToolsetSession) {
        let removed = self.registry.unregister_toolset(&self.config.id);
        info!(toolset = %self.config.id, removed, "unregistered remote tools");
        session.client.close().await;
    }

    async fn open(&self) -> Result<Arc<ToolsetSession>, TurnloopError> {
        let options = ClientOptions {
            label: self.config.id.clone(),
            sequential: self.config.sequential,
            handshake_timeout: self.runtime.handshake_timeout,
            teardown_grace: self.runtime.teardown_grace,
        };
        let params = self.config.params.clone();
        let budget = self.runtime.handshake_timeout;

        let (client, schemas) = with_timeout(budget, async move {
            let client = McpClient::spawn(&params, options).await?;
            match client.list_tools(&CancellationToken::new()).await {
                Ok(schemas) => Ok((client, schemas)),
                Err(err) => {
                    client.close().await;
                    Err(err)
                }
            }
        })
        .await
        .map_err(|err| match err {
            TurnloopError::Timeout(ms) => TurnloopError::Transport(format!(
                "{}: startup did not finish within {ms}ms",
                self.config.id
            )),
            other => other,
        })?;

        let session = Arc::new(ToolsetSession {
            id: self.config.id.clone(),
            client,
            call_timeout: self.config.call_timeout.unwrap_or(self.runtime.tool_timeout),
        });

        if let Err(err) = self.register(&session, schemas) {
            self.teardown(&session).await;
            return Err(err);
        }
        Ok(session)
    }

    fn register(
        &self,
        session: &Arc<ToolsetSession>,
        schemas: Vec<Tool>,
    ) -> Result<(), TurnloopError> {
        let provider: Arc<dyn ToolProvider> = session.clone();
        let mut registered = 0usize;
        for schema in schemas {
            if !self.config.admits(&schema.name) {
                continue;
            }
            let tool = RemoteTool::new(
                provider.clone(),
                DiscoveredTool {
                    description: schema.description.map(|d| d.to_string()).unwrap_or_default(),
                    parameters: ToolParameters::from_schema(serde_json::Value::Object(
                        (*schema.input_schema).clone(),
                    )),
                    output_schema: schema
                        .output_schema
                        .map(|out| serde_json::Value::Object((*out).clone())),
                    name: schema.name.to_string(),
                },
            )
            .with_timeout(Some(session.call_timeout));
            self.registry.register(tool)?;
            registered += 1;
        }

        if let Some(filter) = &self.config.tool_filter {
            let names = self.tool_names();
            for wanted in filter.iter().filter(|n| !names.contains(n)) {
                warn!(toolset = %self.config.id, tool = %wanted, "filtered tool not offered by server");
            }
        }
        info!(toolset = %self.config.id, registered, "remote toolset connected");
        Ok(())
    }
}

impl std::fmt::Debug for RemoteToolset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteToolset")
            .field("id", &self.config.id)
            .field("command", &self.config.params.display())
            .finish()
    }
}
