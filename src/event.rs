//! Events: the immutable, ordered records of a session's history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TurnloopError;
use crate::state::StateDelta;

/// Author of events carrying the caller's messages.
pub const USER_AUTHOR: &str = "user";

/// A tool-call request issued by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Outcome of one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success { payload: serde_json::Value },
    Error { reason: String, message: String },
}

impl ToolOutcome {
    pub fn from_error(error: &TurnloopError) -> Self {
        Self::Error {
            reason: error.reason().to_string(),
            message: error.to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Error reason, if this outcome is an error.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Error { reason, .. } => Some(reason),
        }
    }

    /// JSON shape handed back to the model.
    pub fn to_payload(&self) -> serde_json::Value {
        match self {
            Self::Success { payload } => payload.clone(),
            Self::Error { reason, message } => serde_json::json!({
                "error": message,
                "reason": reason,
            }),
        }
    }
}

/// Result of a tool call, correlated by call id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    pub outcome: ToolOutcome,
}

impl ToolResult {
    pub fn success(call: &ToolCall, payload: serde_json::Value) -> Self {
        Self {
            call_id: call.call_id.clone(),
            name: call.name.clone(),
            outcome: ToolOutcome::Success { payload },
        }
    }

    pub fn failure(call: &ToolCall, error: &TurnloopError) -> Self {
        Self {
            call_id: call.call_id.clone(),
            name: call.name.clone(),
            outcome: ToolOutcome::from_error(error),
        }
    }
}

/// Event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventContent {
    Text { text: String },
    ToolCall(ToolCall),
    ToolResult(ToolResult),
}

/// One record in a session's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    /// Position in the session log, assigned on append.
    #[serde(default)]
    pub seq: u64,
    /// Turn that produced the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<Uuid>,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub content: EventContent,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub escalated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_delta: Option<StateDelta>,
}

impl Event {
    pub fn new(author: impl Into<String>, content: EventContent) -> Self {
        Self {
            id: Uuid::new_v4(),
            seq: 0,
            invocation_id: None,
            author: author.into(),
            timestamp: Utc::now(),
            content,
            is_final: false,
            escalated: false,
            state_delta: None,
        }
    }

    pub fn text(author: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(author, EventContent::Text { text: text.into() })
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(USER_AUTHOR, text)
    }

    pub fn tool_call(author: impl Into<String>, call: ToolCall) -> Self {
        Self::new(author, EventContent::ToolCall(call))
    }

    pub fn tool_result(author: impl Into<String>, result: ToolResult) -> Self {
        Self::new(author, EventContent::ToolResult(result))
    }

    pub fn with_invocation(mut self, invocation_id: Uuid) -> Self {
        self.invocation_id = Some(invocation_id);
        self
    }

    pub fn with_state_delta(mut self, delta: StateDelta) -> Self {
        self.state_delta = (!delta.is_empty()).then_some(delta);
        self
    }

    pub fn mark_final(mut self) -> Self {
        self.is_final = true;
        self
    }

    pub fn mark_escalated(mut self) -> Self {
        self.is_final = true;
        self.escalated = true;
        self
    }

    /// Whether this event ends a turn.
    pub fn is_terminal(&self) -> bool {
        self.is_final || self.escalated
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            EventContent::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn as_tool_call(&self) -> Option<&ToolCall> {
        match &self.content {
            EventContent::ToolCall(call) => Some(call),
            _ => None,
        }
    }

    pub fn as_tool_result(&self) -> Option<&ToolResult> {
        match &self.content {
            EventContent::ToolResult(result) => Some(result),
            _ => None,
        }
    }
}
