//! Workflow agents: several agents taking turns on one session.
//!
//! A workflow posts the user message once, then each step answers the
//! session history as it stands. Steps hand results to each other through
//! state: an agent's `output_key` is filled in by its final answer and read
//! back by later instructions through `{key}` placeholders.
//!
//! Escalation stops a step. [`SequentialAgent`] and [`ParallelAgent`]
//! pass it up; [`LoopAgent`] treats a tool-requested escalation as its exit
//! signal and finishes normally.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info};

use super::runtime::AgentRuntime;
use crate::agent_loop::{CompletedTurn, EscalationReason, TurnOrchestrator, TurnOutcome};
use crate::error::TurnloopError;
use crate::event::Event;
use crate::session::{SessionKey, SessionService};

/// Everything one step produced.
#[derive(Debug, Clone, Default)]
pub struct WorkflowRun {
    /// Turns in step order.
    pub turns: Vec<CompletedTurn>,
    /// The escalated turn that stopped the step, if one did.
    pub escalation: Option<TurnOutcome>,
}

impl WorkflowRun {
    pub fn is_escalated(&self) -> bool {
        self.escalation.is_some()
    }

    /// Final answer of the last turn that produced one.
    pub fn last_answer(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|turn| turn.outcome.is_final())
            .map(|turn| turn.outcome.message.as_str())
    }

    /// Agent names in the order their turns appear.
    pub fn agents(&self) -> Vec<&str> {
        self.turns
            .iter()
            .filter_map(|turn| turn.events.first().map(|event| event.author.as_str()))
            .collect()
    }

    fn absorb(&mut self, other: WorkflowRun) {
        self.turns.extend(other.turns);
        if self.escalation.is_none() {
            self.escalation = other.escalation;
        }
    }
}

/// Something that can take a turn on a session's current history.
#[async_trait]
pub trait WorkflowStep: Send + Sync {
    fn name(&self) -> &str;

    async fn run_step(&self, key: &SessionKey) -> Result<WorkflowRun, TurnloopError>;
}

#[async_trait]
impl WorkflowStep for TurnOrchestrator {
    fn name(&self) -> &str {
        &self.profile().name
    }

    async fn run_step(&self, key: &SessionKey) -> Result<WorkflowRun, TurnloopError> {
        let turn = self.run_continuation(key).await?;
        let escalation = turn.outcome.is_escalated().then(|| turn.outcome.clone());
        Ok(WorkflowRun {
            turns: vec![turn],
            escalation,
        })
    }
}

#[async_trait]
impl WorkflowStep for AgentRuntime {
    fn name(&self) -> &str {
        self.agent().name()
    }

    async fn run_step(&self, key: &SessionKey) -> Result<WorkflowRun, TurnloopError> {
        self.orchestrator().run_step(key).await
    }
}

macro_rules! step_builders {
    () => {
        /// Append a step.
        pub fn with_step(self, step: impl WorkflowStep + 'static) -> Self {
            self.with_step_arc(Arc::new(step))
        }

        pub fn with_step_arc(mut self, step: Arc<dyn WorkflowStep>) -> Self {
            self.steps.push(step);
            self
        }

        pub fn steps(&self) -> &[Arc<dyn WorkflowStep>] {
            &self.steps
        }
    };
}

/// Runs its steps one after another. Stops at the first escalation.
pub struct SequentialAgent {
    name: String,
    steps: Vec<Arc<dyn WorkflowStep>>,
}

impl SequentialAgent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    step_builders!();
}

#[async_trait]
impl WorkflowStep for SequentialAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_step(&self, key: &SessionKey) -> Result<WorkflowRun, TurnloopError> {
        let mut run = WorkflowRun::default();
        for step in &self.steps {
            debug!(workflow = %self.name, step = step.name(), "running step");
            run.absorb(step.run_step(key).await?);
            if run.is_escalated() {
                break;
            }
        }
        Ok(run)
    }
}

/// Runs its steps concurrently on the same session and waits for all.
///
/// Turns are reported in step order. If several steps escalate, the first
/// in step order is reported.
pub struct ParallelAgent {
    name: String,
    steps: Vec<Arc<dyn WorkflowStep>>,
}

impl ParallelAgent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    step_builders!();
}

#[async_trait]
impl WorkflowStep for ParallelAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_step(&self, key: &SessionKey) -> Result<WorkflowRun, TurnloopError> {
        debug!(workflow = %self.name, branches = self.steps.len(), "fanning out");
        let results = join_all(self.steps.iter().map(|step| step.run_step(key))).await;

        let mut run = WorkflowRun::default();
        for result in results {
            run.absorb(result?);
        }
        Ok(run)
    }
}

/// Repeats its steps in order, up to `max_iterations` rounds.
pub struct LoopAgent {
    name: String,
    max_iterations: usize,
    steps: Vec<Arc<dyn WorkflowStep>>,
}

impl LoopAgent {
    pub fn new(name: impl Into<String>, max_iterations: usize) -> Self {
        Self {
            name: name.into(),
            max_iterations,
            steps: Vec::new(),
        }
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    step_builders!();
}

#[async_trait]
impl WorkflowStep for LoopAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_step(&self, key: &SessionKey) -> Result<WorkflowRun, TurnloopError> {
        let mut run = WorkflowRun::default();
        for iteration in 1..=self.max_iterations {
            for step in &self.steps {
                let mut step_run = step.run_step(key).await?;
                let exit = step_run
                    .escalation
                    .as_ref()
                    .is_some_and(|outcome| outcome.reason == Some(EscalationReason::ToolRequested));
                if exit {
                    step_run.escalation = None;
                }
                run.absorb(step_run);

                if exit {
                    info!(workflow = %self.name, iteration, step = step.name(), "loop exit requested");
                    return Ok(run);
                }
                if run.is_escalated() {
                    return Ok(run);
                }
            }
            debug!(workflow = %self.name, iteration, "loop iteration finished");
        }
        info!(workflow = %self.name, max_iterations = self.max_iterations, "loop reached its iteration limit");
        Ok(run)
    }
}

/// Entry point for a workflow: posts the user message, then runs the root.
pub struct Workflow {
    root: Arc<dyn WorkflowStep>,
    sessions: Arc<dyn SessionService>,
}

impl Workflow {
    pub fn new(root: impl WorkflowStep + 'static, sessions: Arc<dyn SessionService>) -> Self {
        Self {
            root: Arc::new(root),
            sessions,
        }
    }

    pub fn root(&self) -> &Arc<dyn WorkflowStep> {
        &self.root
    }

    pub async fn run(&self, key: &SessionKey, message: impl Into<String>) -> Result<WorkflowRun, TurnloopError> {
        self.sessions.append_event(key, Event::user(message)).await?;
        let run = self.root.run_step(key).await?;
        info!(
            workflow = self.root.name(),
            turns = run.turns.len(),
            escalated = run.is_escalated(),
            "workflow finished"
        );
        Ok(run)
    }
}
