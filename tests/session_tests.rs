mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;

use common::key;
use turnloop::prelude::*;

async fn file_backed(dir: &std::path::Path) -> InMemorySessionService {
    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(dir));
    InMemorySessionService::with_store(store).await.unwrap()
}

#[tokio::test]
async fn sessions_survive_a_reload_without_temp_state() {
    let dir = tempfile::tempdir().unwrap();
    let session = key("persisted");
    {
        let service = file_backed(dir.path()).await;
        service
            .create_session(&session, Some(StateDelta::new().with("app:greeting", "hi")))
            .await
            .unwrap();
        service.append_event(&session, Event::user("hello")).await.unwrap();
        service
            .append_event(
                &session,
                Event::text("agent", "noted").with_state_delta(
                    StateDelta::new()
                        .with("topic", "weather")
                        .with("user:city", "Oslo")
                        .with("temp:draft", "scratch"),
                ),
            )
            .await
            .unwrap();

        let live = service.get_session(&session).await.unwrap();
        assert_eq!(live.state.get("temp:draft"), Some(&json!("scratch")));
    }

    let reloaded = file_backed(dir.path()).await;
    let restored = reloaded.get_session(&session).await.unwrap();
    assert_eq!(restored.events.len(), 2);
    assert_eq!(restored.events[0].as_text(), Some("hello"));
    assert_eq!(restored.events[1].seq, 1);
    assert_eq!(restored.state.get("topic"), Some(&json!("weather")));
    assert_eq!(restored.state.get("user:city"), Some(&json!("Oslo")));
    assert_eq!(restored.state.get("app:greeting"), Some(&json!("hi")));
    assert!(!restored.state.contains_key("temp:draft"));

    let delta = restored.events[1].state_delta.as_ref().unwrap();
    assert!(delta.get("temp:draft").is_none());
    assert!(delta.get("topic").is_some());
}

#[tokio::test]
async fn user_and_app_scopes_are_shared_across_sessions() {
    let service = InMemorySessionService::new();
    let first = key("one");
    let other_user = SessionKey::new("test-app", "user-2", "one");
    service.create_session(&first, None).await.unwrap();

    service
        .append_event(
            &first,
            Event::text("agent", "saved").with_state_delta(
                StateDelta::new()
                    .with("user:language", "nb")
                    .with("app:motd", "welcome")
                    .with("draft", "only here"),
            ),
        )
        .await
        .unwrap();

    let sibling = service.create_session(&key("two"), None).await.unwrap();
    assert_eq!(sibling.state.get("user:language"), Some(&json!("nb")));
    assert_eq!(sibling.state.get("app:motd"), Some(&json!("welcome")));
    assert!(sibling.state.get("draft").is_none());

    let stranger = service.create_session(&other_user, None).await.unwrap();
    assert!(stranger.state.get("user:language").is_none());
    assert_eq!(stranger.state.get("app:motd"), Some(&json!("welcome")));
}

#[tokio::test]
async fn null_value_removes_a_key() {
    let service = InMemorySessionService::new();
    let session = key("removal");
    service
        .create_session(&session, Some(StateDelta::new().with("mode", "fast")))
        .await
        .unwrap();

    service
        .append_event(
            &session,
            Event::text("agent", "reset").with_state_delta(StateDelta::new().without("mode")),
        )
        .await
        .unwrap();

    let current = service.get_session(&session).await.unwrap();
    assert!(!current.state.contains_key("mode"));
}

#[tokio::test]
async fn lifecycle_errors_are_typed() {
    let service = InMemorySessionService::new();
    let session = key("life");

    assert!(matches!(
        service.get_session(&session).await,
        Err(TurnloopError::NotFound(_))
    ));
    service.create_session(&session, None).await.unwrap();
    assert!(matches!(
        service.create_session(&session, None).await,
        Err(TurnloopError::AlreadyExists(_))
    ));
    let again = service
        .create_session_with(&session, None, CreatePolicy::GetOrCreate)
        .await
        .unwrap();
    assert_eq!(again.key, session);

    assert_eq!(
        service.list_sessions("test-app", "user-1").await.unwrap(),
        vec![session.clone()]
    );
    service.delete_session(&session).await.unwrap();
    assert!(matches!(
        service.delete_session(&session).await,
        Err(TurnloopError::NotFound(_))
    ));
    assert!(matches!(
        service.append_event(&session, Event::user("late")).await,
        Err(TurnloopError::NotFound(_))
    ));
}

#[tokio::test]
async fn temp_keys_are_rejected_as_initial_state() {
    let service = InMemorySessionService::new();
    let err = service
        .create_session(&key("t"), Some(StateDelta::new().with("temp:x", 1)))
        .await
        .unwrap_err();
    assert!(matches!(err, TurnloopError::InvalidState(_)));
}
