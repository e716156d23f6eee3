//! Model backends: what the orchestrator asks, and what it gets back.

pub mod openai;
pub mod scripted;

pub use openai::OpenAiChatBackend;
pub use scripted::ScriptedBackend;

use async_trait::async_trait;

use crate::error::TurnloopError;
use crate::event::{Event, ToolCall};
use crate::tools::ToolDefinition;

/// One request to the model: full history plus the tool catalogue.
#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    pub agent_name: String,
    /// System prompt.
    pub instruction: Option<String>,
    pub history: Vec<Event>,
    pub tools: Vec<ToolDefinition>,
}

impl ModelRequest {
    /// Text of the most recent user message, if any.
    pub fn last_user_text(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|event| event.author == crate::event::USER_AUTHOR)
            .and_then(Event::as_text)
    }

    /// Tool results produced since the last user message.
    pub fn pending_results(&self) -> Vec<&crate::event::ToolResult> {
        let start = self
            .history
            .iter()
            .rposition(|event| event.author == crate::event::USER_AUTHOR)
            .map_or(0, |index| index + 1);
        self.history[start..]
            .iter()
            .filter_map(Event::as_tool_result)
            .collect()
    }
}

/// What the model decided.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelResponse {
    /// A final answer.
    Text(String),
    /// One or more tool calls, optionally with accompanying text.
    ToolCalls {
        text: Option<String>,
        calls: Vec<ToolCall>,
    },
    /// The backend cannot continue; the turn ends escalated.
    Escalate { message: String },
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn tool_call(call: ToolCall) -> Self {
        Self::ToolCalls {
            text: None,
            calls: vec![call],
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self::ToolCalls { text: None, calls }
    }

    pub fn escalate(message: impl Into<String>) -> Self {
        Self::Escalate {
            message: message.into(),
        }
    }
}

/// A language model the orchestrator can consult.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Identifier used in logs.
    fn model_id(&self) -> &str;

    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse, TurnloopError>;
}
