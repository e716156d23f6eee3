//! In-memory session service with optional write-through persistence.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use super::store::KeyValueStore;
use super::{CreatePolicy, Session, SessionKey, SessionService};
use crate::error::TurnloopError;
use crate::event::Event;
use crate::state::{self, State, StateDelta, StateMap, StateScope};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionRecord {
    key: SessionKey,
    events: Vec<Event>,
    state: StateMap,
    last_update: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct UserStateRecord {
    app_name: String,
    user_id: String,
    state: StateMap,
}

#[derive(Debug, Serialize, Deserialize)]
struct AppStateRecord {
    app_name: String,
    state: StateMap,
}

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<SessionKey, SessionRecord>,
    user_state: HashMap<(String, String), StateMap>,
    app_state: HashMap<String, StateMap>,
}

impl Inner {
    fn view(&self, record: &SessionRecord) -> Session {
        let key = &record.key;
        let empty = StateMap::new();
        let app = self.app_state.get(&key.app_name).unwrap_or(&empty);
        let user = self
            .user_state
            .get(&user_slot(key))
            .unwrap_or(&empty);
        Session {
            key: key.clone(),
            events: record.events.clone(),
            state: State::merged(app, user, &record.state),
            last_update: record.last_update,
        }
    }

    fn app_map(&self, key: &SessionKey) -> StateMap {
        self.app_state.get(&key.app_name).cloned().unwrap_or_default()
    }

    fn user_map(&self, key: &SessionKey) -> StateMap {
        self.user_state.get(&user_slot(key)).cloned().unwrap_or_default()
    }
}

/// Scope maps rewritten by one mutation, committed only after persistence.
struct PendingWrite {
    app: Option<StateMap>,
    user: Option<StateMap>,
}

/// Session service holding everything in process memory.
///
/// When built with [`InMemorySessionService::with_store`], every mutation
/// is written through to the store before it becomes visible, and the
/// service starts from whatever the store already holds.
pub struct InMemorySessionService {
    inner: RwLock<Inner>,
    store: Option<Arc<dyn KeyValueStore>>,
}

impl Default for InMemorySessionService {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySessionService {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            store: None,
        }
    }

    /// Build a service backed by `store`, reloading persisted sessions and
    /// app/user state.
    pub async fn with_store(store: Arc<dyn KeyValueStore>) -> Result<Self, TurnloopError> {
        let mut inner = Inner::default();

        for key in store.list("app/").await? {
            if let Some(value) = store.get(&key).await? {
                let record: AppStateRecord = serde_json::from_value(value)?;
                inner.app_state.insert(record.app_name, record.state);
            }
        }
        for key in store.list("user/").await? {
            if let Some(value) = store.get(&key).await? {
                let record: UserStateRecord = serde_json::from_value(value)?;
                inner
                    .user_state
                    .insert((record.app_name, record.user_id), record.state);
            }
        }
        for key in store.list("session/").await? {
            if let Some(value) = store.get(&key).await? {
                let record: SessionRecord = serde_json::from_value(value)?;
                inner.sessions.insert(record.key.clone(), record);
            }
        }
        debug!(sessions = inner.sessions.len(), "reloaded session store");

        Ok(Self {
            inner: RwLock::new(inner),
            store: Some(store),
        })
    }

    async fn persist(
        &self,
        record: &SessionRecord,
        pending: &PendingWrite,
    ) -> Result<(), TurnloopError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let key = &record.key;

        if let Some(app) = &pending.app {
            let value = serde_json::to_value(AppStateRecord {
                app_name: key.app_name.clone(),
                state: app.clone(),
            })?;
            store.put(&app_store_key(key), value).await?;
        }
        if let Some(user) = &pending.user {
            let value = serde_json::to_value(UserStateRecord {
                app_name: key.app_name.clone(),
                user_id: key.user_id.clone(),
                state: user.clone(),
            })?;
            store.put(&user_store_key(key), value).await?;
        }

        let persisted = SessionRecord {
            key: key.clone(),
            events: record.events.iter().map(without_temp).collect(),
            state: state::persistent_view(&record.state),
            last_update: record.last_update,
        };
        store
            .put(&session_store_key(key), serde_json::to_value(persisted)?)
            .await
    }
}

#[async_trait]
impl SessionService for InMemorySessionService {
    async fn create_session_with(
        &self,
        key: &SessionKey,
        initial_state: Option<StateDelta>,
        policy: CreatePolicy,
    ) -> Result<Session, TurnloopError> {
        validate_key(key)?;
        let delta = initial_state.unwrap_or_default();
        delta.validate()?;
        if delta.has_scope(StateScope::Temp) {
            return Err(TurnloopError::InvalidState(
                "initial state may not contain temp: keys".into(),
            ));
        }

        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.sessions.get(key) {
            return match policy {
                CreatePolicy::FailIfExists => Err(TurnloopError::AlreadyExists(key.to_string())),
                CreatePolicy::GetOrCreate => Ok(inner.view(existing)),
            };
        }

        let scoped = delta.split();
        let mut app = inner.app_map(key);
        let mut user = inner.user_map(key);
        let mut record = SessionRecord {
            key: key.clone(),
            events: Vec::new(),
            state: StateMap::new(),
            last_update: Utc::now(),
        };
        scoped.apply_to(&mut app, &mut user, &mut record.state);
        let pending = PendingWrite {
            app: (!scoped.app.is_empty()).then_some(app),
            user: (!scoped.user.is_empty()).then_some(user),
        };

        self.persist(&record, &pending).await?;
        commit_scopes(&mut inner, key, pending);
        debug!(session = %key, "created session");
        let session = inner.view(&record);
        inner.sessions.insert(key.clone(), record);
        Ok(session)
    }

    async fn get_session(&self, key: &SessionKey) -> Result<Session, TurnloopError> {
        let inner = self.inner.read().await;
        let record = inner
            .sessions
            .get(key)
            .ok_or_else(|| TurnloopError::NotFound(format!("session {key}")))?;
        Ok(inner.view(record))
    }

    async fn list_sessions(
        &self,
        app_name: &str,
        user_id: &str,
    ) -> Result<Vec<SessionKey>, TurnloopError> {
        let inner = self.inner.read().await;
        let mut keys: Vec<SessionKey> = inner
            .sessions
            .keys()
            .filter(|key| key.app_name == app_name && key.user_id == user_id)
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete_session(&self, key: &SessionKey) -> Result<(), TurnloopError> {
        let mut inner = self.inner.write().await;
        if !inner.sessions.contains_key(key) {
            return Err(TurnloopError::NotFound(format!("session {key}")));
        }
        if let Some(store) = &self.store {
            store.delete(&session_store_key(key)).await?;
        }
        inner.sessions.remove(key);
        debug!(session = %key, "deleted session");
        Ok(())
    }

    async fn append_event(&self, key: &SessionKey, mut event: Event) -> Result<u64, TurnloopError> {
        if event.author.trim().is_empty() {
            return Err(TurnloopError::InvalidEvent(
                "event author must not be empty".into(),
            ));
        }
        if let Some(delta) = &event.state_delta {
            delta.validate()?;
        }

        let mut inner = self.inner.write().await;
        let record = inner
            .sessions
            .get(key)
            .ok_or_else(|| TurnloopError::NotFound(format!("session {key}")))?;

        let seq = record.events.len() as u64;
        event.seq = seq;

        // Stage every scope, persist, then commit. Nothing is visible until
        // all of it succeeded.
        let mut staged = SessionRecord {
            key: key.clone(),
            events: Vec::new(),
            state: record.state.clone(),
            last_update: event.timestamp,
        };
        let mut pending = PendingWrite {
            app: None,
            user: None,
        };
        if let Some(delta) = &event.state_delta {
            let scoped = delta.split();
            let mut app = inner.app_map(key);
            let mut user = inner.user_map(key);
            scoped.apply_to(&mut app, &mut user, &mut staged.state);
            pending.app = (!scoped.app.is_empty()).then_some(app);
            pending.user = (!scoped.user.is_empty()).then_some(user);
        }

        if self.store.is_some() {
            let mut full = staged.clone();
            full.events = record.events.clone();
            full.events.push(event.clone());
            self.persist(&full, &pending).await?;
        }

        commit_scopes(&mut inner, key, pending);
        if let Some(record) = inner.sessions.get_mut(key) {
            record.state = staged.state;
            record.last_update = staged.last_update;
            record.events.push(event);
        }
        debug!(session = %key, seq, "appended event");
        Ok(seq)
    }

    async fn events_since(
        &self,
        key: &SessionKey,
        offset: u64,
    ) -> Result<Vec<Event>, TurnloopError> {
        let inner = self.inner.read().await;
        let record = inner
            .sessions
            .get(key)
            .ok_or_else(|| TurnloopError::NotFound(format!("session {key}")))?;
        let start = (offset as usize).min(record.events.len());
        Ok(record.events[start..].to_vec())
    }

    async fn clear_temp_state(&self, key: &SessionKey) -> Result<usize, TurnloopError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .sessions
            .get_mut(key)
            .ok_or_else(|| TurnloopError::NotFound(format!("session {key}")))?;
        Ok(state::clear_temp(&mut record.state))
    }
}

fn commit_scopes(inner: &mut Inner, key: &SessionKey, pending: PendingWrite) {
    if let Some(app) = pending.app {
        inner.app_state.insert(key.app_name.clone(), app);
    }
    if let Some(user) = pending.user {
        inner.user_state.insert(user_slot(key), user);
    }
}

fn validate_key(key: &SessionKey) -> Result<(), TurnloopError> {
    if key.app_name.is_empty() || key.user_id.is_empty() || key.session_id.is_empty() {
        return Err(TurnloopError::InvalidState(format!(
            "session key '{key}' has an empty component"
        )));
    }
    Ok(())
}

fn without_temp(event: &Event) -> Event {
    let mut event = event.clone();
    event.state_delta = event
        .state_delta
        .take()
        .map(|delta| delta.persistent())
        .filter(|delta| !delta.is_empty());
    event
}

fn user_slot(key: &SessionKey) -> (String, String) {
    (key.app_name.clone(), key.user_id.clone())
}

/// Escape `/` so components cannot collide once joined into a store key.
fn escape(component: &str) -> String {
    component.replace('%', "%25").replace('/', "%2F")
}

fn session_store_key(key: &SessionKey) -> String {
    format!(
        "session/{}/{}/{}",
        escape(&key.app_name),
        escape(&key.user_id),
        escape(&key.session_id)
    )
}

fn user_store_key(key: &SessionKey) -> String {
    format!("user/{}/{}", escape(&key.app_name), escape(&key.user_id))
}

fn app_store_key(key: &SessionKey) -> String {
    format!("app/{}", escape(&key.app_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::store::MemoryStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn key(session_id: &str) -> SessionKey {
        SessionKey::new("shop", "ada", session_id)
    }

    async fn service_with(session_id: &str) -> InMemorySessionService {
        let service = InMemorySessionService::new();
        service.create_session(&key(session_id), None).await.unwrap();
        service
    }

    #[tokio::test]
    async fn appends_keep_order_and_count() {
        let service = service_with("s1").await;
        for i in 0..5 {
            let seq = service
                .append_event(&key("s1"), Event::user(format!("msg {i}")))
                .await
                .unwrap();
            assert_eq!(seq, i as u64);
        }

        let session = service.get_session(&key("s1")).await.unwrap();
        let texts: Vec<_> = session.events.iter().filter_map(Event::as_text).collect();
        assert_eq!(texts, vec!["msg 0", "msg 1", "msg 2", "msg 3", "msg 4"]);
        assert!(session.events.iter().enumerate().all(|(i, e)| e.seq == i as u64));
    }

    #[tokio::test]
    async fn duplicate_create_fails_unless_get_or_create() {
        let service = service_with("s1").await;

        let err = service.create_session(&key("s1"), None).await.unwrap_err();
        assert!(matches!(err, TurnloopError::AlreadyExists(_)));

        let session = service
            .create_session_with(&key("s1"), None, CreatePolicy::GetOrCreate)
            .await
            .unwrap();
        assert_eq!(session.key, key("s1"));
    }

    #[tokio::test]
    async fn missing_session_is_not_found() {
        let service = InMemorySessionService::new();
        let err = service.get_session(&key("nope")).await.unwrap_err();
        assert!(matches!(err, TurnloopError::NotFound(_)));
        let err = service
            .append_event(&key("nope"), Event::user("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, TurnloopError::NotFound(_)));
    }

    #[tokio::test]
    async fn empty_author_is_rejected() {
        let service = service_with("s1").await;
        let err = service
            .append_event(&key("s1"), Event::text("  ", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, TurnloopError::InvalidEvent(_)));
        assert!(service.get_session(&key("s1")).await.unwrap().events.is_empty());
    }

    #[tokio::test]
    async fn user_state_is_shared_across_sessions() {
        let service = service_with("a").await;
        service.create_session(&key("b"), None).await.unwrap();
        let other_user = SessionKey::new("shop", "bob", "c");
        service.create_session(&other_user, None).await.unwrap();

        let event = Event::text("agent", "noted")
            .with_state_delta(StateDelta::new().with("user:name", "Ada").with("cart", json!([1])));
        service.append_event(&key("a"), event).await.unwrap();

        let b = service.get_session(&key("b")).await.unwrap();
        assert_eq!(b.state.get("user:name"), Some(&json!("Ada")));
        assert_eq!(b.state.get("cart"), None);

        let c = service.get_session(&other_user).await.unwrap();
        assert_eq!(c.state.get("user:name"), None);
    }

    #[tokio::test]
    async fn app_state_is_shared_across_users() {
        let service = service_with("a").await;
        let other_user = SessionKey::new("shop", "bob", "c");
        service.create_session(&other_user, None).await.unwrap();

        let event = Event::text("agent", "x")
            .with_state_delta(StateDelta::new().with("app:currency", "EUR"));
        service.append_event(&key("a"), event).await.unwrap();

        let c = service.get_session(&other_user).await.unwrap();
        assert_eq!(c.state.get("app:currency"), Some(&json!("EUR")));
    }

    #[tokio::test]
    async fn invalid_delta_applies_nothing() {
        let service = service_with("s1").await;
        let event = Event::text("agent", "x").with_state_delta(
            StateDelta::new()
                .with("user:name", "Ada")
                .with("app:", 1),
        );

        assert!(service.append_event(&key("s1"), event).await.is_err());
        let session = service.get_session(&key("s1")).await.unwrap();
        assert!(session.state.is_empty());
        assert!(session.events.is_empty());
    }

    #[tokio::test]
    async fn temp_keys_are_cleared_on_request() {
        let service = service_with("s1").await;
        let event = Event::text("agent", "x")
            .with_state_delta(StateDelta::new().with("temp:step", 1).with("keep", 2));
        service.append_event(&key("s1"), event).await.unwrap();

        assert_eq!(service.clear_temp_state(&key("s1")).await.unwrap(), 1);
        let state = service.get_session(&key("s1")).await.unwrap().state;
        assert!(!state.contains_key("temp:step"));
        assert_eq!(state.get("keep"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn initial_state_respects_scopes() {
        let service = InMemorySessionService::new();
        let initial = StateDelta::new().with("user:tier", "gold").with("cart", json!([]));
        let session = service.create_session(&key("s1"), Some(initial)).await.unwrap();
        assert_eq!(session.state.get("user:tier"), Some(&json!("gold")));

        let err = service
            .create_session(&key("s2"), Some(StateDelta::new().with("temp:x", 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, TurnloopError::InvalidState(_)));
    }

    #[tokio::test]
    async fn events_since_reads_from_offset() {
        let service = service_with("s1").await;
        for i in 0..4 {
            service
                .append_event(&key("s1"), Event::user(format!("{i}")))
                .await
                .unwrap();
        }
        let tail = service.events_since(&key("s1"), 2).await.unwrap();
        assert_eq!(tail.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![2, 3]);
        assert!(service.events_since(&key("s1"), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_and_delete_sessions() {
        let service = service_with("b").await;
        service.create_session(&key("a"), None).await.unwrap();
        service
            .create_session(&SessionKey::new("shop", "bob", "z"), None)
            .await
            .unwrap();

        let keys = service.list_sessions("shop", "ada").await.unwrap();
        assert_eq!(keys, vec![key("a"), key("b")]);

        service.delete_session(&key("a")).await.unwrap();
        assert_eq!(service.list_sessions("shop", "ada").await.unwrap(), vec![key("b")]);
        assert!(service.delete_session(&key("a")).await.is_err());
    }

    #[tokio::test]
    async fn store_round_trip_skips_temp_state() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let service = InMemorySessionService::with_store(store.clone()).await.unwrap();
        service.create_session(&key("s1"), None).await.unwrap();
        let event = Event::text("agent", "x").with_state_delta(
            StateDelta::new()
                .with("user:name", "Ada")
                .with("app:theme", "dark")
                .with("cart", json!(["pear"]))
                .with("temp:scratch", 1),
        );
        service.append_event(&key("s1"), event).await.unwrap();

        let reloaded = InMemorySessionService::with_store(store).await.unwrap();
        let session = reloaded.get_session(&key("s1")).await.unwrap();

        assert_eq!(session.events.len(), 1);
        assert_eq!(session.state.get("user:name"), Some(&json!("Ada")));
        assert_eq!(session.state.get("app:theme"), Some(&json!("dark")));
        assert_eq!(session.state.get("cart"), Some(&json!(["pear"])));
        assert!(!session.state.contains_key("temp:scratch"));
        let persisted_delta = session.events[0].state_delta.as_ref().unwrap();
        assert!(persisted_delta.get("temp:scratch").is_none());
    }
}
