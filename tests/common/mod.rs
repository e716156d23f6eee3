//! Shared test helpers.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use turnloop::agent_loop::{TurnInfo, TurnObserver, TurnOutcome, TurnState};
use turnloop::config::RuntimeConfig;
use turnloop::event::{ToolCall, ToolResult};
use turnloop::model::ModelResponse;
use turnloop::session::SessionKey;
use turnloop::tools::{FunctionTool, ToolParameters};

/// Runtime timings small enough for tests.
pub fn fast_config() -> RuntimeConfig {
    RuntimeConfig::builder()
        .max_iterations(5)
        .tool_timeout(Duration::from_secs(2))
        .model_timeout(Duration::from_secs(2))
        .turn_timeout(Duration::from_secs(10))
        .handshake_timeout(Duration::from_secs(10))
        .teardown_grace(Duration::from_millis(500))
        .build()
}

pub fn key(session_id: &str) -> SessionKey {
    SessionKey::new("test-app", "user-1", session_id)
}

/// `calculate_percentage(number, percentage)` returning `{ "result": n }`.
pub fn percentage_tool() -> FunctionTool {
    FunctionTool::new(
        "calculate_percentage",
        "Compute percentage% of number",
        ToolParameters::object()
            .number("number", "Base value", true)
            .number("percentage", "Percent to take", true)
            .build(),
        |args, _ctx| async move {
            let value = args.get_f64("number")? * args.get_f64("percentage")? / 100.0;
            Ok(json!({ "result": value as i64 }))
        },
    )
}

pub fn call(id: &str, name: &str, arguments: serde_json::Value) -> ModelResponse {
    ModelResponse::tool_call(ToolCall::new(id, name, arguments))
}

/// Reference tool server command, with extra flags.
#[cfg(feature = "toolserver")]
pub fn toolserver(flags: &[&str]) -> turnloop::mcp::StdioServerParams {
    turnloop::mcp::StdioServerParams::new(env!("CARGO_BIN_EXE_turnloop-toolserver"))
        .args(flags.iter().copied())
}

/// Records hook invocations as short strings.
pub struct RecordingObserver {
    label: String,
    log: Arc<Mutex<Vec<String>>>,
}

impl RecordingObserver {
    pub fn new(label: &str, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            label: label.to_string(),
            log,
        }
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(format!("{}:{entry}", self.label));
    }
}

impl TurnObserver for RecordingObserver {
    fn on_turn_start(&self, _turn: &TurnInfo) {
        self.record("start".into());
    }

    fn on_transition(&self, _turn: &TurnInfo, _from: TurnState, to: TurnState) {
        self.record(format!("-> {to}"));
    }

    fn on_tool_start(&self, _turn: &TurnInfo, call: &ToolCall) {
        self.record(format!("tool_start {}", call.call_id));
    }

    fn on_tool_end(&self, _turn: &TurnInfo, result: &ToolResult) {
        self.record(format!("tool_end {}", result.call_id));
    }

    fn on_turn_end(&self, _turn: &TurnInfo, outcome: &TurnOutcome) {
        self.record(format!("end {}", outcome.state));
    }
}
