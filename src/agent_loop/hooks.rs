//! Turn observers, invoked synchronously at state-machine transitions.

use tracing::{debug, info};

use super::types::{TurnInfo, TurnOutcome, TurnState};
use crate::event::{ToolCall, ToolResult};
use crate::model::ModelResponse;

/// Lifecycle hooks for a turn.
///
/// Observers run in registration order on the turn's task. Keep them
/// cheap; a slow observer stalls the turn.
pub trait TurnObserver: Send + Sync {
    fn on_turn_start(&self, _turn: &TurnInfo) {}

    fn on_transition(&self, _turn: &TurnInfo, _from: TurnState, _to: TurnState) {}

    fn on_model_response(&self, _turn: &TurnInfo, _response: &ModelResponse) {}

    /// Called in issue order, before the dispatch phase starts.
    fn on_tool_start(&self, _turn: &TurnInfo, _call: &ToolCall) {}

    /// Called in issue order, after the whole phase has returned.
    fn on_tool_end(&self, _turn: &TurnInfo, _result: &ToolResult) {}

    fn on_turn_end(&self, _turn: &TurnInfo, _outcome: &TurnOutcome) {}
}

/// Logs every hook through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl TurnObserver for TracingObserver {
    fn on_turn_start(&self, turn: &TurnInfo) {
        info!(turn_id = %turn.turn_id, session = %turn.session, agent = %turn.agent_name, "turn started");
    }

    fn on_transition(&self, turn: &TurnInfo, from: TurnState, to: TurnState) {
        debug!(turn_id = %turn.turn_id, %from, %to, "turn transition");
    }

    fn on_model_response(&self, turn: &TurnInfo, response: &ModelResponse) {
        let kind = match response {
            ModelResponse::Text(_) => "text",
            ModelResponse::ToolCalls { .. } => "tool_calls",
            ModelResponse::Escalate { .. } => "escalate",
        };
        debug!(turn_id = %turn.turn_id, kind, "model responded");
    }

    fn on_tool_start(&self, turn: &TurnInfo, call: &ToolCall) {
        debug!(turn_id = %turn.turn_id, call_id = %call.call_id, tool = %call.name, "tool dispatched");
    }

    fn on_tool_end(&self, turn: &TurnInfo, result: &ToolResult) {
        debug!(
            turn_id = %turn.turn_id,
            call_id = %result.call_id,
            tool = %result.name,
            error = result.outcome.reason(),
            "tool finished"
        );
    }

    fn on_turn_end(&self, turn: &TurnInfo, outcome: &TurnOutcome) {
        info!(
            turn_id = %turn.turn_id,
            state = %outcome.state,
            reason = outcome.reason.map(|r| r.as_str()),
            model_calls = outcome.model_calls,
            dispatch_phases = outcome.dispatch_phases,
            "turn finished"
        );
    }
}
