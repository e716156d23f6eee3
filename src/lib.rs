//! turnloop: an agent turn runtime.
//!
//! Drives one user turn at a time through repeated rounds of "ask the
//! model, dispatch the tool calls it requests, fold the results back"
//! until the model gives a final answer or the turn escalates. Tools are
//! local functions or remote toolsets reached over JSON-RPC on a
//! subprocess's stdio. Sessions own the ordered event history and the
//! scoped state (`user:`, `app:`, `temp:` and session-local keys).
//! Several agents can share a session through sequential, parallel and
//! loop workflows, handing results on through state.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use turnloop::prelude::*;
//!
//! # async fn example() -> turnloop::error::Result<()> {
//! let percentage = FunctionTool::new(
//!     "calculate_percentage",
//!     "Compute a percentage of a number",
//!     ToolParameters::object()
//!         .number("number", "The base value", true)
//!         .number("percentage", "Percent to take", true)
//!         .build(),
//!     |args, _ctx| async move {
//!         let value = args.get_f64("number")? * args.get_f64("percentage")? / 100.0;
//!         Ok(serde_json::json!({ "result": value }))
//!     },
//! );
//! let agent = Agent::new("calculator").with_tool(percentage);
//! let backend = Arc::new(OpenAiChatBackend::from_env()?);
//! let sessions = Arc::new(InMemorySessionService::new());
//! let runtime = AgentRuntime::start(agent, backend, sessions, RuntimeConfig::load()?).await?;
//!
//! let key = SessionKey::new("demo", "user-1", "session-1");
//! runtime.create_session(&key).await?;
//! let turn = runtime.run_turn(&key, "What is 15% of 1200?").await?;
//! println!("{}", turn.outcome.message);
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod agent_loop;
pub mod config;
pub mod error;
pub mod event;
pub mod mcp;
pub mod model;
pub mod prelude;
pub mod session;
pub mod state;
pub mod stream;
pub mod tools;
pub mod util;
