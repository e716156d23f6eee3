//! Tool trait, invocation context and closure-based tool wrapper.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::arguments::ToolArguments;
use super::types::{ToolCapability, ToolDefinition, ToolParameters};
use crate::error::TurnloopError;
use crate::state::{State, StateDelta};

/// Side effects a tool requested during one invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolActions {
    pub state_delta: StateDelta,
    pub escalate: bool,
}

/// Context available during tool execution.
///
/// Carries a snapshot of session state taken when the dispatch phase
/// began. Writes made through [`ToolContext::set_state`] are collected and
/// committed with the call's result event, never applied directly.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub call_id: String,
    pub tool_name: String,
    pub agent_name: String,
    state: Arc<State>,
    cancel: CancellationToken,
    actions: Arc<Mutex<ToolActions>>,
}

impl ToolContext {
    pub fn new(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        agent_name: impl Into<String>,
        state: Arc<State>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            agent_name: agent_name.into(),
            state,
            cancel,
            actions: Arc::default(),
        }
    }

    /// Read a key, seeing this call's own pending writes first.
    pub fn get_state(&self, key: &str) -> Option<serde_json::Value> {
        let actions = self.lock();
        match actions.state_delta.get(key) {
            Some(pending) => pending.clone().filter(|value| !value.is_null()),
            None => self.state.get(key).cloned(),
        }
    }

    /// Snapshot of session state as of dispatch.
    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn set_state(&self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.lock().state_delta.set(key, value);
    }

    pub fn remove_state(&self, key: impl Into<String>) {
        self.lock().state_delta.remove(key);
    }

    /// Ask the orchestrator to end the turn after this dispatch phase.
    pub fn escalate(&self) {
        self.lock().escalate = true;
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Collected actions so far.
    pub fn actions(&self) -> ToolActions {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ToolActions> {
        self.actions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Core tool trait: implement to create custom tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (must match what the model calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema parameters.
    fn parameters(&self) -> &ToolParameters;

    /// JSON Schema of the result, when the tool declares one.
    fn output_schema(&self) -> Option<&serde_json::Value> {
        None
    }

    fn capability(&self) -> ToolCapability {
        ToolCapability::Local
    }

    /// Per-tool invocation budget overriding the registry default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Execute the tool with validated arguments.
    async fn execute(
        &self,
        args: &ToolArguments,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, TurnloopError>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.parameters().schema.clone(),
            output_schema: self.output_schema().cloned(),
            capability: self.capability(),
        }
    }
}

/// Type alias for the tool handler function.
type ToolHandler = dyn Fn(
        ToolArguments,
        ToolContext,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, TurnloopError>> + Send>>
    + Send
    + Sync;

/// Closure-based tool for quick tool creation.
///
/// ```
/// use turnloop::tools::{FunctionTool, ToolParameters};
///
/// let tool = FunctionTool::new(
///     "calculate_percentage",
///     "Compute a percentage of an amount",
///     ToolParameters::object()
///         .number("amount", "Base amount", true)
///         .number("percentage", "Percentage", true)
///         .build(),
///     |args, _ctx| async move {
///         let amount = args.get_f64("amount")?;
///         let pct = args.get_f64("percentage")?;
///         Ok(serde_json::json!({ "result": amount * pct / 100.0 }))
///     },
/// );
/// # let _ = tool;
/// ```
pub struct FunctionTool {
    name: String,
    description: String,
    parameters: ToolParameters,
    output_schema: Option<serde_json::Value>,
    timeout: Option<Duration>,
    handler: Arc<ToolHandler>,
}

impl FunctionTool {
    /// Create a tool from a closure.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: ToolParameters,
        handler: F,
    ) -> Self
    where
        F: Fn(ToolArguments, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, TurnloopError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            output_schema: None,
            timeout: None,
            handler: Arc::new(move |args, ctx| Box::pin(handler(args, ctx))),
        }
    }

    pub fn with_output_schema(mut self, schema: serde_json::Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> &ToolParameters {
        &self.parameters
    }

    fn output_schema(&self) -> Option<&serde_json::Value> {
        self.output_schema.as_ref()
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn execute(
        &self,
        args: &ToolArguments,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, TurnloopError> {
        (self.handler)(args.clone(), ctx.clone()).await
    }
}

impl std::fmt::Debug for FunctionTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pending_writes_shadow_snapshot() {
        let snapshot: State = serde_json::from_value(json!({ "cart": ["apple"] })).unwrap();
        let ctx = ToolContext::new("c1", "add", "agent", Arc::new(snapshot), CancellationToken::new());

        assert_eq!(ctx.get_state("cart"), Some(json!(["apple"])));
        ctx.set_state("cart", json!(["apple", "pear"]));
        assert_eq!(ctx.get_state("cart"), Some(json!(["apple", "pear"])));
        ctx.remove_state("cart");
        assert_eq!(ctx.get_state("cart"), None);
        assert_eq!(ctx.state().get("cart"), Some(&json!(["apple"])));
    }

    #[test]
    fn clones_share_actions() {
        let ctx = ToolContext::default();
        let clone = ctx.clone();
        clone.escalate();
        clone.set_state("temp:seen", true);

        let actions = ctx.actions();
        assert!(actions.escalate);
        assert_eq!(actions.state_delta.len(), 1);
    }

    #[tokio::test]
    async fn function_tool_runs_closure() {
        let tool = FunctionTool::new("double", "Double it", ToolParameters::empty(), |args, _| async move {
            Ok(json!(args.get_i64("n")? * 2))
        });

        let result = tool
            .execute(&ToolArguments::new(json!({ "n": 21 })), &ToolContext::default())
            .await
            .unwrap();
        assert_eq!(result, json!(42));
        assert_eq!(tool.definition().capability, ToolCapability::Local);
    }
}
