//! Agent runtime: tools registered, toolsets connected, turns on demand.

use std::sync::Arc;

use tracing::info;

use super::agent::Agent;
use crate::agent_loop::{CompletedTurn, TurnHandle, TurnObserver, TurnOrchestrator};
use crate::config::RuntimeConfig;
use crate::error::TurnloopError;
use crate::mcp::RemoteToolset;
use crate::model::ModelBackend;
use crate::session::{CreatePolicy, Session, SessionKey, SessionService};
use crate::state::StateDelta;
use crate::tools::ToolRegistry;

/// High-level entry point wrapping [`TurnOrchestrator`].
///
/// # Example
///
/// ```no_run
/// # use std::sync::Arc;
/// # use turnloop::prelude::*;
/// # async fn example() -> turnloop::error::Result<()> {
/// let agent = Agent::new("helper").with_instruction("Answer briefly.");
/// let backend = Arc::new(ScriptedBackend::new([ModelResponse::text("hi")]));
/// let sessions = Arc::new(InMemorySessionService::new());
/// let runtime = AgentRuntime::start(agent, backend, sessions, RuntimeConfig::default()).await?;
///
/// let key = SessionKey::new("app", "user", "s1");
/// runtime.create_session(&key).await?;
/// let turn = runtime.run_turn(&key, "hello").await?;
/// assert!(turn.outcome.is_final());
/// runtime.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct AgentRuntime {
    agent: Agent,
    orchestrator: TurnOrchestrator,
    toolsets: Vec<RemoteToolset>,
}

impl AgentRuntime {
    /// Register the agent's local tools and connect its toolsets. If any
    /// toolset fails to start, those already connected are closed again.
    pub async fn start(
        agent: Agent,
        backend: Arc<dyn ModelBackend>,
        sessions: Arc<dyn SessionService>,
        config: RuntimeConfig,
    ) -> Result<Self, TurnloopError> {
        config.validate()?;
        let registry = Arc::new(ToolRegistry::new(config.tool_timeout));
        for tool in agent.tools() {
            registry.register_arc(tool.clone())?;
        }

        let mut toolsets = Vec::with_capacity(agent.toolsets().len());
        for toolset in agent.toolsets() {
            match RemoteToolset::connect(toolset.clone(), registry.clone(), &config).await {
                Ok(connected) => toolsets.push(connected),
                Err(err) => {
                    for connected in &toolsets {
                        connected.close().await;
                    }
                    return Err(err);
                }
            }
        }

        info!(
            agent = %agent.name(),
            tools = registry.len(),
            toolsets = toolsets.len(),
            model = backend.model_id(),
            "agent runtime started"
        );
        let orchestrator = TurnOrchestrator::new(sessions, backend, registry, agent.profile(), config);
        Ok(Self {
            agent,
            orchestrator,
            toolsets,
        })
    }

    /// Add a turn observer.
    pub fn with_observer(mut self, observer: Arc<dyn TurnObserver>) -> Self {
        self.orchestrator = self.orchestrator.with_observer(observer);
        self
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn orchestrator(&self) -> &TurnOrchestrator {
        &self.orchestrator
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        self.orchestrator.registry()
    }

    pub fn sessions(&self) -> &Arc<dyn SessionService> {
        self.orchestrator.sessions()
    }

    pub fn toolset(&self, id: &str) -> Option<&RemoteToolset> {
        self.toolsets.iter().find(|toolset| toolset.id() == id)
    }

    pub fn toolsets(&self) -> &[RemoteToolset] {
        &self.toolsets
    }

    /// Create a session, failing if the key is taken.
    pub async fn create_session(&self, key: &SessionKey) -> Result<Session, TurnloopError> {
        self.sessions().create_session(key, None).await
    }

    /// Fetch a session, creating it (with `initial_state`) if missing.
    pub async fn get_or_create_session(
        &self,
        key: &SessionKey,
        initial_state: Option<StateDelta>,
    ) -> Result<Session, TurnloopError> {
        self.sessions()
            .create_session_with(key, initial_state, CreatePolicy::GetOrCreate)
            .await
    }

    pub async fn start_turn(
        &self,
        key: &SessionKey,
        message: impl Into<String>,
    ) -> Result<TurnHandle, TurnloopError> {
        self.orchestrator.start_turn(key, message).await
    }

    pub async fn run_turn(
        &self,
        key: &SessionKey,
        message: impl Into<String>,
    ) -> Result<CompletedTurn, TurnloopError> {
        self.orchestrator.run_turn(key, message).await
    }

    /// Answer the session's current history without a new user message.
    pub async fn run_continuation(&self, key: &SessionKey) -> Result<CompletedTurn, TurnloopError> {
        self.orchestrator.run_continuation(key).await
    }

    /// Restart a remote toolset and rediscover its tools.
    pub async fn reconnect_toolset(&self, id: &str) -> Result<(), TurnloopError> {
        self.toolset(id)
            .ok_or_else(|| TurnloopError::NotFound(format!("toolset '{id}'")))?
            .reconnect()
            .await
    }

    /// Close every toolset and stop their processes.
    pub async fn shutdown(self) {
        for toolset in &self.toolsets {
            toolset.close().await;
        }
        info!(agent = %self.agent.name(), "agent runtime stopped");
    }
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("agent", &self.agent)
            .field("toolsets", &self.toolsets)
            .finish()
    }
}
