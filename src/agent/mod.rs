//! Agents: a named instruction, its tools, the runtime that hosts them,
//! and workflows that compose several of them.

pub mod agent;
pub mod runtime;
pub mod workflow;

pub use agent::Agent;
pub use runtime::AgentRuntime;
pub use workflow::{LoopAgent, ParallelAgent, SequentialAgent, Workflow, WorkflowRun, WorkflowStep};
