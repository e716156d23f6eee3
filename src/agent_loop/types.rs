//! Core turn types for the agent loop.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::Event;
use crate::session::SessionKey;

/// Unique turn identifier (also the `invocation_id` of its events).
pub type TurnId = Uuid;

/// Turn lifecycle state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TurnState {
    AwaitingModel,
    ToolCallsPending,
    DispatchingTools,
    Final,
    Escalated,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Final | Self::Escalated)
    }
}

/// Why a turn ended escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscalationReason {
    /// The backend reported it cannot continue.
    BackendEscalation,
    /// The backend call itself failed or timed out.
    ModelError,
    MaxIterationsExceeded { limit: usize },
    /// A tool asked to leave the loop.
    ToolRequested,
    Cancelled,
    TurnTimeout,
    /// The session store rejected a write.
    Internal,
}

impl EscalationReason {
    /// Stable machine-readable name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BackendEscalation => "backend_escalation",
            Self::ModelError => "model_error",
            Self::MaxIterationsExceeded { .. } => "max_iterations_exceeded",
            Self::ToolRequested => "tool_requested",
            Self::Cancelled => "cancelled",
            Self::TurnTimeout => "turn_timeout",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who the orchestrator speaks as.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AgentProfile {
    pub name: String,
    pub instruction: Option<String>,
    /// Final answer text is stored in state under this key.
    pub output_key: Option<String>,
}

impl AgentProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }

    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }
}

/// Identity of a running turn, handed to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnInfo {
    pub turn_id: TurnId,
    pub session: SessionKey,
    pub agent_name: String,
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub turn_id: TurnId,
    pub session: SessionKey,
    pub state: TurnState,
    /// Final answer, or the escalation message.
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<EscalationReason>,
    /// Backend requests made.
    pub model_calls: usize,
    pub dispatch_phases: usize,
}

impl TurnOutcome {
    pub fn is_final(&self) -> bool {
        self.state == TurnState::Final
    }

    pub fn is_escalated(&self) -> bool {
        self.state == TurnState::Escalated
    }
}

/// A finished turn together with every event it produced.
#[derive(Debug, Clone)]
pub struct CompletedTurn {
    pub outcome: TurnOutcome,
    pub events: Vec<Event>,
}

impl CompletedTurn {
    /// The terminal event. Every turn ends with one.
    pub fn terminal_event(&self) -> Option<&Event> {
        self.events.last().filter(|event| event.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn turn_state_names_are_snake_case() {
        assert_eq!(TurnState::DispatchingTools.to_string(), "dispatching_tools");
        assert_eq!(TurnState::from_str("awaiting_model").unwrap(), TurnState::AwaitingModel);
        assert!(TurnState::Escalated.is_terminal());
        assert!(!TurnState::ToolCallsPending.is_terminal());
    }

    #[test]
    fn escalation_reason_serializes_with_limit() {
        let value = serde_json::to_value(EscalationReason::MaxIterationsExceeded { limit: 3 }).unwrap();
        assert_eq!(value, serde_json::json!({ "kind": "max_iterations_exceeded", "limit": 3 }));
        assert_eq!(EscalationReason::TurnTimeout.to_string(), "turn_timeout");
    }
}
