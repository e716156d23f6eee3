//! Convenience re-exports for common use.

pub use crate::agent::{
    Agent, AgentRuntime, LoopAgent, ParallelAgent, SequentialAgent, Workflow, WorkflowRun,
    WorkflowStep,
};
pub use crate::agent_loop::{
    CompletedTurn, EscalationReason, TracingObserver, TurnHandle, TurnObserver, TurnOrchestrator,
    TurnOutcome, TurnState,
};
pub use crate::config::RuntimeConfig;
pub use crate::error::{Result, TurnloopError};
pub use crate::event::{Event, EventContent, ToolCall, ToolOutcome, ToolResult};
pub use crate::mcp::{RemoteToolset, StdioServerParams, ToolsetConfig};
pub use crate::model::{ModelBackend, ModelRequest, ModelResponse, OpenAiChatBackend, ScriptedBackend};
pub use crate::session::{
    CreatePolicy, FileStore, InMemorySessionService, KeyValueStore, MemoryStore, Session,
    SessionKey, SessionService,
};
pub use crate::state::{State, StateDelta, StateScope};
pub use crate::stream::{EventLog, EventStream};
pub use crate::tools::{
    FunctionTool, Tool, ToolArguments, ToolContext, ToolParameters, ToolRegistry,
};
