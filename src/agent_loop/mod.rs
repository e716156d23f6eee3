//! Agent loop: the turn state machine, its observers and handles.

pub mod hooks;
pub mod instructions;
pub mod runner;
pub mod types;

pub use hooks::{TracingObserver, TurnObserver};
pub use instructions::inject_state;
pub use runner::{TurnHandle, TurnOrchestrator};
pub use types::{
    AgentProfile, CompletedTurn, EscalationReason, TurnId, TurnInfo, TurnOutcome, TurnState,
};
