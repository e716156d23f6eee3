//! Tool registry: unique names, schema-checked invocation.

use std::sync::{Arc, LazyLock, PoisonError, RwLock};
use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};

use super::arguments::{normalize_arguments, ToolArguments};
use super::tool::{Tool, ToolContext};
use super::types::ToolDefinition;
use super::validation::{validate_arguments, validate_schema};
use crate::error::TurnloopError;

static TOOL_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_.-]{0,63}$").expect("tool name regex must compile")
});

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Holds local tools and remote tool adapters behind one interface.
///
/// Registration order is preserved in [`ToolRegistry::definitions`].
pub struct ToolRegistry {
    tools: RwLock<Vec<Arc<dyn Tool>>>,
    default_timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_TOOL_TIMEOUT)
    }
}

impl ToolRegistry {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            tools: RwLock::new(Vec::new()),
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn register(&self, tool: impl Tool + 'static) -> Result<(), TurnloopError> {
        self.register_arc(Arc::new(tool))
    }

    /// Register a tool. Fails with `DuplicateTool` on a name collision,
    /// leaving the existing tool in place.
    pub fn register_arc(&self, tool: Arc<dyn Tool>) -> Result<(), TurnloopError> {
        let name = tool.name().to_string();
        if !TOOL_NAME_RE.is_match(&name) {
            return Err(TurnloopError::InvalidToolDefinition {
                tool_name: name,
                message: "name must match [A-Za-z_][A-Za-z0-9_.-]{0,63}".into(),
            });
        }
        validate_schema(&tool.parameters().schema).map_err(|message| {
            TurnloopError::InvalidToolDefinition {
                tool_name: name.clone(),
                message,
            }
        })?;

        let mut tools = self.write();
        if tools.iter().any(|existing| existing.name() == name) {
            return Err(TurnloopError::DuplicateTool(name));
        }
        debug!(tool = %name, capability = ?tool.capability(), "registered tool");
        tools.push(tool);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Tool>, TurnloopError> {
        self.read()
            .iter()
            .find(|tool| tool.name() == name)
            .cloned()
            .ok_or_else(|| TurnloopError::ToolNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().iter().any(|tool| tool.name() == name)
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let mut tools = self.write();
        let index = tools.iter().position(|tool| tool.name() == name)?;
        Some(tools.remove(index))
    }

    /// Drop every tool hosted by a remote toolset. Returns how many went.
    pub fn unregister_toolset(&self, toolset_id: &str) -> usize {
        let mut tools = self.write();
        let before = tools.len();
        tools.retain(|tool| tool.capability().toolset_id() != Some(toolset_id));
        before - tools.len()
    }

    /// Schema catalogue handed to the model backend.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.read().iter().map(|tool| tool.definition()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.read().iter().map(|tool| tool.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Validate and run one call.
    ///
    /// Arguments that fail the tool's schema yield `InvalidArguments` and
    /// the body is never entered. The call is bounded by the tool's
    /// timeout (or the registry default) and by the context's
    /// cancellation token; body failures come back as `ExecutionError`.
    pub async fn invoke(
        &self,
        name: &str,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, TurnloopError> {
        let tool = self.resolve(name)?;
        let arguments = normalize_arguments(name, arguments)?;
        validate_arguments(&arguments, &tool.parameters().schema)
            .map_err(|message| TurnloopError::invalid_arguments(name, message))?;

        let budget = tool.timeout().unwrap_or(self.default_timeout);
        let args = ToolArguments::for_tool(name, arguments);
        let cancel = ctx.cancellation().clone();

        debug!(tool = name, call_id = %ctx.call_id, "invoking tool");
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                Err(TurnloopError::Cancelled(format!("tool '{name}' cancelled")))
            }
            outcome = tokio::time::timeout(budget, tool.execute(&args, ctx)) => match outcome {
                Ok(result) => result.map_err(|err| classify(name, err)),
                Err(_) => {
                    cancel.cancel();
                    Err(TurnloopError::Timeout(budget.as_millis() as u64))
                }
            },
        };

        if let Err(err) = &result {
            warn!(tool = name, call_id = %ctx.call_id, reason = err.reason(), error = %err, "tool call failed");
        }
        result
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<dyn Tool>>> {
        self.tools.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<dyn Tool>>> {
        self.tools.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

/// Keep classified failures as they are; wrap anything else as an
/// execution error carrying the original cause.
fn classify(name: &str, err: TurnloopError) -> TurnloopError {
    match err {
        TurnloopError::ExecutionError { .. }
        | TurnloopError::InvalidArguments { .. }
        | TurnloopError::Timeout(_)
        | TurnloopError::Cancelled(_)
        | TurnloopError::Transport(_)
        | TurnloopError::Spawn { .. } => err,
        other => TurnloopError::execution(name, other),
    }
}
