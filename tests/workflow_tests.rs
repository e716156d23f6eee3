mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use serde_json::json;

use common::{call, fast_config, key};
use turnloop::prelude::*;

async fn agent(
    sessions: &Arc<InMemorySessionService>,
    agent: Agent,
    backend: Arc<ScriptedBackend>,
) -> AgentRuntime {
    AgentRuntime::start(agent, backend, sessions.clone(), fast_config())
        .await
        .expect("runtime starts")
}

fn exit_loop() -> FunctionTool {
    FunctionTool::new(
        "exit_loop",
        "Call only when no further changes are needed",
        ToolParameters::empty(),
        |_args, ctx| async move {
            ctx.escalate();
            Ok(json!({}))
        },
    )
}

#[tokio::test]
async fn sequential_steps_share_one_session_in_order() {
    let sessions = Arc::new(InMemorySessionService::new());
    let writer_backend = Arc::new(ScriptedBackend::new([ModelResponse::text("first draft")]));
    let editor_backend = Arc::new(ScriptedBackend::new([ModelResponse::text("polished draft")]));
    let writer = agent(
        &sessions,
        Agent::new("writer").with_instruction("Write a draft.").with_output_key("draft"),
        writer_backend,
    )
    .await;
    let editor = agent(
        &sessions,
        Agent::new("editor").with_instruction("Polish this: {draft}"),
        editor_backend.clone(),
    )
    .await;
    let pipeline = SequentialAgent::new("pipeline").with_step(writer).with_step(editor);
    let workflow = Workflow::new(pipeline, sessions.clone());
    let key = key("sequential");
    sessions.create_session(&key, None).await.unwrap();

    let run = workflow.run(&key, "Write about rivers").await.unwrap();

    assert!(!run.is_escalated());
    assert_eq!(run.agents(), vec!["writer", "editor"]);
    assert_eq!(run.last_answer(), Some("polished draft"));
    // The editor saw the writer's answer through state.
    let request = &editor_backend.requests()[0];
    assert_eq!(request.instruction.as_deref(), Some("Polish this: first draft"));
    assert_eq!(request.last_user_text(), Some("Write about rivers"));

    let session = sessions.get_session(&key).await.unwrap();
    assert_eq!(session.state.get("draft"), Some(&json!("first draft")));
    let user_messages = session.events.iter().filter(|e| e.author == "user").count();
    assert_eq!(user_messages, 1);
}

#[tokio::test]
async fn parallel_steps_run_concurrently_and_fill_their_own_keys() {
    let sessions = Arc::new(InMemorySessionService::new());
    let delay = Duration::from_millis(300);
    let mut research = ParallelAgent::new("research");
    for (name, key_name, answer) in [
        ("flights", "flight_results", "Two direct flights"),
        ("hotels", "hotel_results", "Boutique hotels downtown"),
        ("activities", "activities_results", "Museums and a river cruise"),
    ] {
        let backend = Arc::new(ScriptedBackend::new([ModelResponse::text(answer)]).with_delay(delay));
        let runtime = agent(&sessions, Agent::new(name).with_output_key(key_name), backend).await;
        research = research.with_step(runtime);
    }
    let synthesizer_backend = Arc::new(ScriptedBackend::new([ModelResponse::text("itinerary")]));
    let synthesizer = agent(
        &sessions,
        Agent::new("synthesizer")
            .with_instruction("Flights: {flight_results}\nHotels: {hotel_results}\nDo: {activities_results}"),
        synthesizer_backend.clone(),
    )
    .await;
    let pipeline = SequentialAgent::new("trip").with_step(research).with_step(synthesizer);
    let workflow = Workflow::new(pipeline, sessions.clone());
    let key = key("parallel");
    sessions.create_session(&key, None).await.unwrap();

    let started = Instant::now();
    let run = workflow.run(&key, "Plan three days in Lisbon").await.unwrap();

    // Three 300ms answers in well under 900ms.
    assert!(started.elapsed() < Duration::from_millis(800), "{:?}", started.elapsed());
    assert_eq!(run.agents(), vec!["flights", "hotels", "activities", "synthesizer"]);
    let session = sessions.get_session(&key).await.unwrap();
    assert_eq!(session.state.get("flight_results"), Some(&json!("Two direct flights")));
    assert_eq!(session.state.get("hotel_results"), Some(&json!("Boutique hotels downtown")));
    assert_eq!(
        session.state.get("activities_results"),
        Some(&json!("Museums and a river cruise"))
    );
    assert_eq!(
        synthesizer_backend.requests()[0].instruction.as_deref(),
        Some("Flights: Two direct flights\nHotels: Boutique hotels downtown\nDo: Museums and a river cruise")
    );
}

#[tokio::test]
async fn loop_stops_when_a_tool_requests_exit() {
    let sessions = Arc::new(InMemorySessionService::new());
    let writer_backend = Arc::new(ScriptedBackend::new([
        ModelResponse::text("draft one"),
        ModelResponse::text("draft two"),
        ModelResponse::text("draft three"),
    ]));
    let critic_backend = Arc::new(ScriptedBackend::new([
        ModelResponse::text("Tighten the second line."),
        call("done", "exit_loop", json!({})),
    ]));
    let writer = agent(
        &sessions,
        Agent::new("writer").with_output_key("current_text"),
        writer_backend.clone(),
    )
    .await;
    let critic = agent(
        &sessions,
        Agent::new("critic")
            .with_instruction("Review '{current_text}'. Previous notes: {critique?}")
            .with_tool(exit_loop())
            .with_output_key("critique"),
        critic_backend.clone(),
    )
    .await;
    let refinement = LoopAgent::new("refinement", 6).with_step(writer).with_step(critic);
    let workflow = Workflow::new(refinement, sessions.clone());
    let key = key("loop-exit");
    sessions.create_session(&key, None).await.unwrap();

    let run = workflow.run(&key, "A poem about tides").await.unwrap();

    assert!(!run.is_escalated());
    assert_eq!(run.agents(), vec!["writer", "critic", "writer", "critic"]);
    assert_eq!(writer_backend.request_count(), 2);
    let critic_requests = critic_backend.requests();
    assert_eq!(
        critic_requests[0].instruction.as_deref(),
        Some("Review 'draft one'. Previous notes: ")
    );
    assert_eq!(
        critic_requests[1].instruction.as_deref(),
        Some("Review 'draft two'. Previous notes: Tighten the second line.")
    );
    let last = run.turns.last().unwrap();
    assert_eq!(last.outcome.reason, Some(EscalationReason::ToolRequested));
}

#[tokio::test]
async fn loop_runs_at_most_max_iterations() {
    let sessions = Arc::new(InMemorySessionService::new());
    let writer = agent(
        &sessions,
        Agent::new("writer"),
        Arc::new(ScriptedBackend::from_fn(|_| Ok(ModelResponse::text("again")))),
    )
    .await;
    let critic = agent(
        &sessions,
        Agent::new("critic").with_tool(exit_loop()),
        Arc::new(ScriptedBackend::from_fn(|_| Ok(ModelResponse::text("not yet")))),
    )
    .await;
    let refinement = LoopAgent::new("refinement", 3).with_step(writer).with_step(critic);
    let workflow = Workflow::new(refinement, sessions.clone());
    let key = key("loop-limit");
    sessions.create_session(&key, None).await.unwrap();

    let run = workflow.run(&key, "go").await.unwrap();

    assert!(!run.is_escalated());
    assert_eq!(run.turns.len(), 6);
    assert!(run.turns.iter().all(|turn| turn.outcome.is_final()));
}

#[tokio::test]
async fn other_escalations_stop_the_loop_and_propagate() {
    let sessions = Arc::new(InMemorySessionService::new());
    let writer_backend = Arc::new(ScriptedBackend::from_fn(|_| Ok(ModelResponse::text("draft"))));
    let writer = agent(&sessions, Agent::new("writer"), writer_backend.clone()).await;
    let critic = agent(
        &sessions,
        Agent::new("critic"),
        Arc::new(ScriptedBackend::new([ModelResponse::escalate("cannot review this")])),
    )
    .await;
    let refinement = LoopAgent::new("refinement", 5).with_step(writer).with_step(critic);
    let workflow = Workflow::new(refinement, sessions.clone());
    let key = key("loop-escalation");
    sessions.create_session(&key, None).await.unwrap();

    let run = workflow.run(&key, "go").await.unwrap();

    let escalation = run.escalation.as_ref().expect("escalated");
    assert_eq!(escalation.reason, Some(EscalationReason::BackendEscalation));
    assert_eq!(escalation.message, "cannot review this");
    assert_eq!(writer_backend.request_count(), 1);
    assert_eq!(run.turns.len(), 2);
}

#[tokio::test]
async fn workflow_requires_an_existing_session() {
    let sessions = Arc::new(InMemorySessionService::new());
    let only = agent(
        &sessions,
        Agent::new("solo"),
        Arc::new(ScriptedBackend::new([ModelResponse::text("hi")])),
    )
    .await;
    let workflow = Workflow::new(SequentialAgent::new("s").with_step(only), sessions.clone());

    let err = workflow.run(&key("missing"), "hello").await.unwrap_err();
    assert!(matches!(err, TurnloopError::NotFound(_)));
}
