//! Turn orchestrator: the model/tool loop for one user message.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::hooks::TurnObserver;
use super::instructions::inject_state;
use super::types::{
    AgentProfile, CompletedTurn, EscalationReason, TurnId, TurnInfo, TurnOutcome, TurnState,
};
use crate::config::RuntimeConfig;
use crate::error::TurnloopError;
use crate::event::{Event, ToolCall, ToolResult};
use crate::model::{ModelBackend, ModelRequest, ModelResponse};
use crate::session::{SessionKey, SessionService};
use crate::state::{State, StateDelta};
use crate::stream::{EventLog, EventStream};
use crate::tools::{ToolContext, ToolRegistry};
use crate::util::bounded;

/// Per session, the completion signal of the most recently started turn
/// and that turn's id.
type SessionQueues = Arc<Mutex<HashMap<SessionKey, (TurnId, oneshot::Receiver<()>)>>>;

/// Drives turns for one agent.
///
/// Turns on the same session run one at a time, in the order
/// [`start_turn`](Self::start_turn) was called; turns on different sessions
/// run independently.
#[derive(Clone)]
pub struct TurnOrchestrator {
    sessions: Arc<dyn SessionService>,
    backend: Arc<dyn ModelBackend>,
    registry: Arc<ToolRegistry>,
    profile: AgentProfile,
    config: RuntimeConfig,
    observers: Vec<Arc<dyn TurnObserver>>,
    queues: SessionQueues,
}

impl TurnOrchestrator {
    pub fn new(
        sessions: Arc<dyn SessionService>,
        backend: Arc<dyn ModelBackend>,
        registry: Arc<ToolRegistry>,
        profile: AgentProfile,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            sessions,
            backend,
            registry,
            profile,
            config,
            observers: Vec::new(),
            queues: Arc::default(),
        }
    }

    /// Add an observer. Observers are called in the order added.
    pub fn with_observer(mut self, observer: Arc<dyn TurnObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn profile(&self) -> &AgentProfile {
        &self.profile
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<dyn SessionService> {
        &self.sessions
    }

    /// Start a turn in the background. The session must exist.
    pub async fn start_turn(
        &self,
        key: &SessionKey,
        message: impl Into<String>,
    ) -> Result<TurnHandle, TurnloopError> {
        self.start(key, Some(message.into())).await
    }

    /// Start a turn that answers the session's existing history without a
    /// new user message. Workflow steps after the first run this way.
    pub async fn start_continuation(&self, key: &SessionKey) -> Result<TurnHandle, TurnloopError> {
        self.start(key, None).await
    }

    async fn start(&self, key: &SessionKey, message: Option<String>) -> Result<TurnHandle, TurnloopError> {
        self.sessions.get_session(key).await?;

        let turn_id = Uuid::new_v4();
        let log = EventLog::new();
        let cancel = CancellationToken::new();
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let (done, previous) = self.enqueue(key, turn_id);
        let orchestrator = self.clone();
        let run = TurnRun {
            info: TurnInfo {
                turn_id,
                session: key.clone(),
                agent_name: self.profile.name.clone(),
            },
            log: log.clone(),
            cancel: cancel.clone(),
            timed_out: std::sync::atomic::AtomicBool::new(false),
            poisoned: Mutex::new(HashSet::new()),
        };

        tokio::spawn(async move {
            if let Some(previous) = previous {
                // Also resolves if the previous turn's task died.
                let _ = previous.await;
            }
            let outcome = orchestrator.execute(&run, message).await;
            orchestrator.dequeue(&run.info);
            let _ = done.send(());
            let _ = outcome_tx.send(outcome);
        });

        Ok(TurnHandle {
            turn_id,
            log,
            cancel,
            outcome: outcome_rx,
        })
    }

    /// Run a turn to completion and return everything it produced.
    pub async fn run_turn(
        &self,
        key: &SessionKey,
        message: impl Into<String>,
    ) -> Result<CompletedTurn, TurnloopError> {
        self.start_turn(key, message).await?.complete().await
    }

    /// Run a continuation turn to completion.
    pub async fn run_continuation(&self, key: &SessionKey) -> Result<CompletedTurn, TurnloopError> {
        self.start_continuation(key).await?.complete().await
    }

    /// Take the tail of the session's queue. Returns this turn's completion
    /// sender and the signal of the turn it must wait for, if any.
    fn enqueue(&self, key: &SessionKey, turn_id: TurnId) -> (oneshot::Sender<()>, Option<oneshot::Receiver<()>>) {
        let (done_tx, done_rx) = oneshot::channel();
        let previous = self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), (turn_id, done_rx))
            .map(|(_, previous)| previous);
        (done_tx, previous)
    }

    /// Drop the queue entry if no later turn has queued behind this one.
    fn dequeue(&self, info: &TurnInfo) {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        if queues
            .get(&info.session)
            .is_some_and(|(tail, _)| *tail == info.turn_id)
        {
            queues.remove(&info.session);
        }
    }

    /// Whole turn, including the turn budget, temp-state cleanup and the
    /// terminal event. Never fails; problems end the turn escalated.
    async fn execute(&self, run: &TurnRun, message: Option<String>) -> TurnOutcome {
        self.notify(|o| o.on_turn_start(&run.info));

        let mut progress = Progress::default();
        let outcome = {
            let drive = self.drive(run, message, &mut progress);
            tokio::pin!(drive);
            tokio::select! {
                biased;
                result = &mut drive => result,
                _ = tokio::time::sleep(self.config.turn_timeout) => {
                    warn!(turn_id = %run.info.turn_id, budget_ms = self.config.turn_timeout.as_millis() as u64, "turn timed out");
                    run.timed_out.store(true, std::sync::atomic::Ordering::SeqCst);
                    run.cancel.cancel();
                    // In-flight work observes the token and winds down.
                    match tokio::time::timeout(self.config.teardown_grace, &mut drive).await {
                        Ok(result) => result,
                        Err(_) => Err(TurnloopError::Cancelled("turn did not wind down in time".into())),
                    }
                }
            }
        };

        // Calls whose results were never recorded because the loop was
        // dropped mid-phase still get one.
        for call in std::mem::take(&mut progress.open_calls) {
            let err = TurnloopError::Cancelled(format!("tool '{}' abandoned at turn end", call.name));
            let event = Event::tool_result(&self.profile.name, ToolResult::failure(&call, &err))
                .with_invocation(run.info.turn_id);
            if let Err(err) = self.emit(run, event).await {
                warn!(turn_id = %run.info.turn_id, error = %err, "could not record abandoned call");
            }
        }

        let (state, message, reason) = match outcome {
            Ok(Step::Final(text)) => (TurnState::Final, text, None),
            Ok(Step::Escalate(reason, message)) => (TurnState::Escalated, message, Some(reason)),
            Err(TurnloopError::Cancelled(_)) if run.cancel.is_cancelled() => {
                let reason = run.interruption();
                (TurnState::Escalated, interruption_message(reason, &self.config), Some(reason))
            }
            Err(err) => {
                warn!(turn_id = %run.info.turn_id, error = %err, "turn failed");
                (TurnState::Escalated, format!("turn failed: {err}"), Some(EscalationReason::Internal))
            }
        };

        if state == TurnState::Escalated {
            let event = Event::text(&self.profile.name, &message)
                .with_invocation(run.info.turn_id)
                .mark_escalated();
            if let Err(err) = self.emit(run, event.clone()).await {
                // The caller still gets a terminal event, even unsaved.
                warn!(turn_id = %run.info.turn_id, error = %err, "could not record escalation");
                run.log.push(event);
            }
        }

        match self.sessions.clear_temp_state(&run.info.session).await {
            Ok(cleared) if cleared > 0 => {
                debug!(turn_id = %run.info.turn_id, cleared, "cleared turn-scoped state");
            }
            Ok(_) => {}
            Err(err) => warn!(turn_id = %run.info.turn_id, error = %err, "could not clear temp state"),
        }

        let outcome = TurnOutcome {
            turn_id: run.info.turn_id,
            session: run.info.session.clone(),
            state,
            message,
            reason,
            model_calls: progress.model_calls,
            dispatch_phases: progress.dispatch_phases,
        };
        self.notify(|o| o.on_turn_end(&run.info, &outcome));
        run.log.close();
        outcome
    }

    /// The state machine proper. Returns how the turn should end; the
    /// escalation event itself is written by the caller.
    async fn drive(
        &self,
        run: &TurnRun,
        message: Option<String>,
        progress: &mut Progress,
    ) -> Result<Step, TurnloopError> {
        if let Some(message) = message {
            self.emit(run, Event::user(message).with_invocation(run.info.turn_id))
                .await?;
        }

        let mut state = TurnState::AwaitingModel;
        loop {
            if run.cancel.is_cancelled() {
                return Err(TurnloopError::Cancelled("turn".into()));
            }

            let session = self.sessions.get_session(&run.info.session).await?;
            let request = ModelRequest {
                agent_name: self.profile.name.clone(),
                instruction: self
                    .profile
                    .instruction
                    .as_deref()
                    .map(|template| inject_state(template, &session.state)),
                history: session.events,
                tools: self.registry.definitions(),
            };
            progress.model_calls += 1;
            debug!(
                turn_id = %run.info.turn_id,
                model = self.backend.model_id(),
                iteration = progress.model_calls,
                history = request.history.len(),
                "requesting model"
            );

            let response = match bounded(
                self.config.model_timeout,
                &run.cancel,
                "model call",
                self.backend.generate(&request),
            )
            .await
            {
                Ok(response) => response,
                Err(err @ TurnloopError::Cancelled(_)) => return Err(err),
                Err(err) => {
                    warn!(turn_id = %run.info.turn_id, error = %err, "model backend failed");
                    return Ok(Step::Escalate(
                        EscalationReason::ModelError,
                        format!("model backend failed: {err}"),
                    ));
                }
            };
            self.notify(|o| o.on_model_response(&run.info, &response));

            let (text, calls) = match response {
                ModelResponse::Escalate { message } => {
                    self.transition(run, &mut state, TurnState::Escalated);
                    return Ok(Step::Escalate(EscalationReason::BackendEscalation, message));
                }
                ModelResponse::Text(text) => (Some(text), Vec::new()),
                ModelResponse::ToolCalls { text, calls } => (text, calls),
            };

            if calls.is_empty() {
                let text = text.unwrap_or_default();
                let mut event = Event::text(&self.profile.name, &text)
                    .with_invocation(run.info.turn_id)
                    .mark_final();
                if let Some(key) = &self.profile.output_key {
                    event = event.with_state_delta(StateDelta::new().with(key.as_str(), text.clone()));
                }
                self.emit(run, event).await?;
                self.transition(run, &mut state, TurnState::Final);
                return Ok(Step::Final(text));
            }

            self.transition(run, &mut state, TurnState::ToolCallsPending);
            if progress.dispatch_phases >= self.config.max_iterations {
                let limit = self.config.max_iterations;
                warn!(turn_id = %run.info.turn_id, limit, "tool loop exceeded max iterations");
                self.transition(run, &mut state, TurnState::Escalated);
                return Ok(Step::Escalate(
                    EscalationReason::MaxIterationsExceeded { limit },
                    TurnloopError::MaxIterationsExceeded(limit).to_string(),
                ));
            }

            if let Some(text) = text.filter(|text| !text.is_empty()) {
                self.emit(
                    run,
                    Event::text(&self.profile.name, text).with_invocation(run.info.turn_id),
                )
                .await?;
            }
            let calls = assign_call_ids(calls);
            for call in &calls {
                self.emit(
                    run,
                    Event::tool_call(&self.profile.name, call.clone()).with_invocation(run.info.turn_id),
                )
                .await?;
                progress.open_calls.push(call.clone());
            }

            self.transition(run, &mut state, TurnState::DispatchingTools);
            progress.dispatch_phases += 1;
            let snapshot = Arc::new(session.state);
            for call in &calls {
                self.notify(|o| o.on_tool_start(&run.info, call));
            }
            let outcomes = join_all(
                calls
                    .iter()
                    .map(|call| self.dispatch(run, call, snapshot.clone())),
            )
            .await;

            // Issue order, not completion order.
            let mut escalating = None;
            for dispatched in outcomes {
                self.notify(|o| o.on_tool_end(&run.info, &dispatched.result));
                if dispatched.escalate && escalating.is_none() {
                    escalating = Some(dispatched.result.name.clone());
                }
                let call_id = dispatched.result.call_id.clone();
                let mut event = Event::tool_result(&self.profile.name, dispatched.result)
                    .with_invocation(run.info.turn_id);
                if let Some(delta) = dispatched.state_delta {
                    event = event.with_state_delta(delta);
                }
                self.emit(run, event).await?;
                progress.open_calls.retain(|call| call.call_id != call_id);
            }

            if let Some(tool) = escalating {
                self.transition(run, &mut state, TurnState::Escalated);
                return Ok(Step::Escalate(
                    EscalationReason::ToolRequested,
                    format!("tool '{tool}' requested escalation"),
                ));
            }
            if run.cancel.is_cancelled() {
                return Err(TurnloopError::Cancelled("turn".into()));
            }
            self.transition(run, &mut state, TurnState::AwaitingModel);
        }
    }

    /// Run one call. Failures become error results; nothing here ends the turn.
    async fn dispatch(&self, run: &TurnRun, call: &ToolCall, state: Arc<State>) -> Dispatched {
        let ctx = ToolContext::new(
            &call.call_id,
            &call.name,
            &self.profile.name,
            state,
            run.cancel.child_token(),
        );
        let toolset = self
            .registry
            .resolve(&call.name)
            .ok()
            .and_then(|tool| tool.capability().toolset_id().map(str::to_string));

        if let Some(id) = toolset.as_deref().filter(|id| run.is_poisoned(id)) {
            let err = TurnloopError::Transport(format!(
                "toolset '{id}' is unavailable for the rest of this turn"
            ));
            return Dispatched::failed(call, &err, false);
        }

        let result = self
            .registry
            .invoke(&call.name, call.arguments.clone(), &ctx)
            .await;
        let actions = ctx.actions();

        match result {
            Ok(payload) => {
                if let Err(err) = actions.state_delta.validate() {
                    return Dispatched::failed(call, &err, actions.escalate);
                }
                Dispatched {
                    result: ToolResult::success(call, payload),
                    state_delta: (!actions.state_delta.is_empty()).then_some(actions.state_delta),
                    escalate: actions.escalate,
                }
            }
            Err(err) => {
                if err.is_transport_failure() {
                    if let Some(id) = toolset {
                        warn!(turn_id = %run.info.turn_id, toolset = %id, error = %err, "toolset unavailable for this turn");
                        run.poison(id);
                    }
                }
                Dispatched::failed(call, &err, actions.escalate)
            }
        }
    }

    /// Append to the session, then publish to the turn's stream.
    async fn emit(&self, run: &TurnRun, mut event: Event) -> Result<u64, TurnloopError> {
        let seq = self
            .sessions
            .append_event(&run.info.session, event.clone())
            .await?;
        event.seq = seq;
        run.log.push(event);
        Ok(seq)
    }

    fn transition(&self, run: &TurnRun, state: &mut TurnState, to: TurnState) {
        let from = std::mem::replace(state, to);
        debug!(turn_id = %run.info.turn_id, %from, %to, "transition");
        self.notify(|o| o.on_transition(&run.info, from, to));
    }

    fn notify(&self, hook: impl Fn(&dyn TurnObserver)) {
        for observer in &self.observers {
            hook(observer.as_ref());
        }
    }
}

impl std::fmt::Debug for TurnOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnOrchestrator")
            .field("agent", &self.profile.name)
            .field("model", &self.backend.model_id())
            .field("observers", &self.observers.len())
            .finish()
    }
}

/// Handle for an in-flight turn.
#[derive(Debug)]
pub struct TurnHandle {
    turn_id: TurnId,
    log: EventLog,
    cancel: CancellationToken,
    outcome: oneshot::Receiver<TurnOutcome>,
}

impl TurnHandle {
    pub fn turn_id(&self) -> TurnId {
        self.turn_id
    }

    /// Every event of this turn, from the first.
    pub fn events(&self) -> EventStream {
        self.log.subscribe()
    }

    /// Events from `offset` within this turn.
    pub fn events_from(&self, offset: usize) -> EventStream {
        self.log.subscribe_from(offset)
    }

    /// Abort the turn. In-flight tool calls are reported as cancelled and
    /// the turn ends escalated.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<TurnOutcome, TurnloopError> {
        self.outcome
            .await
            .map_err(|_| TurnloopError::Cancelled("turn task ended without an outcome".into()))
    }

    /// Wait for the outcome and collect every event of the turn.
    pub async fn complete(self) -> Result<CompletedTurn, TurnloopError> {
        let events = self.events();
        let outcome = self.wait().await?;
        Ok(CompletedTurn {
            outcome,
            events: events.collect_all().await,
        })
    }
}

struct TurnRun {
    info: TurnInfo,
    log: EventLog,
    cancel: CancellationToken,
    timed_out: std::sync::atomic::AtomicBool,
    poisoned: Mutex<HashSet<String>>,
}

impl TurnRun {
    fn interruption(&self) -> EscalationReason {
        if self.timed_out.load(std::sync::atomic::Ordering::SeqCst) {
            EscalationReason::TurnTimeout
        } else {
            EscalationReason::Cancelled
        }
    }

    fn is_poisoned(&self, toolset: &str) -> bool {
        self.poisoned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(toolset)
    }

    fn poison(&self, toolset: String) {
        self.poisoned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(toolset);
    }
}

#[derive(Debug, Default)]
struct Progress {
    model_calls: usize,
    dispatch_phases: usize,
    /// Calls recorded without a result yet.
    open_calls: Vec<ToolCall>,
}

enum Step {
    Final(String),
    Escalate(EscalationReason, String),
}

struct Dispatched {
    result: ToolResult,
    state_delta: Option<StateDelta>,
    escalate: bool,
}

impl Dispatched {
    fn failed(call: &ToolCall, err: &TurnloopError, escalate: bool) -> Self {
        Self {
            result: ToolResult::failure(call, err),
            state_delta: None,
            escalate,
        }
    }
}

fn interruption_message(reason: EscalationReason, config: &RuntimeConfig) -> String {
    match reason {
        EscalationReason::TurnTimeout => format!(
            "turn exceeded its {}ms budget",
            config.turn_timeout.as_millis()
        ),
        _ => "turn cancelled by caller".to_string(),
    }
}

/// Give every call a non-empty id, unique within the response.
fn assign_call_ids(calls: Vec<ToolCall>) -> Vec<ToolCall> {
    let mut seen = HashSet::new();
    calls
        .into_iter()
        .map(|mut call| {
            if call.call_id.is_empty() || !seen.insert(call.call_id.clone()) {
                call.call_id = format!("call_{}", Uuid::new_v4().simple());
                seen.insert(call.call_id.clone());
            }
            call
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_ids_are_filled_and_deduplicated() {
        let calls = assign_call_ids(vec![
            ToolCall::new("", "a", json!({})),
            ToolCall::new("x", "b", json!({})),
            ToolCall::new("x", "c", json!({})),
        ]);
        assert!(calls[0].call_id.starts_with("call_"));
        assert_eq!(calls[1].call_id, "x");
        assert_ne!(calls[2].call_id, "x");
        assert_ne!(calls[0].call_id, calls[2].call_id);
    }

    #[test]
    fn interruption_reason_follows_timeout_flag() {
        let run = TurnRun {
            info: TurnInfo {
                turn_id: Uuid::new_v4(),
                session: SessionKey::new("a", "u", "s"),
                agent_name: "agent".into(),
            },
            log: EventLog::new(),
            cancel: CancellationToken::new(),
            timed_out: std::sync::atomic::AtomicBool::new(false),
            poisoned: Mutex::new(HashSet::new()),
        };
        assert_eq!(run.interruption(), EscalationReason::Cancelled);
        run.timed_out.store(true, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(run.interruption(), EscalationReason::TurnTimeout);

        assert!(!run.is_poisoned("fs"));
        run.poison("fs".into());
        assert!(run.is_poisoned("fs"));
    }
}
