//! Session management: ordered event logs and scoped state.

pub mod memory;
pub mod store;

pub use memory::InMemorySessionService;
pub use store::{FileStore, KeyValueStore, MemoryStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TurnloopError;
use crate::event::Event;
use crate::state::{State, StateDelta};

/// The only external address of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub app_name: String,
    pub user_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(
        app_name: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }

    /// Key with a freshly generated session id.
    pub fn generate(app_name: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::new(app_name, user_id, uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.app_name, self.user_id, self.session_id)
    }
}

/// Snapshot of a session: its history and the merged state view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub key: SessionKey,
    pub events: Vec<Event>,
    pub state: State,
    pub last_update: DateTime<Utc>,
}

impl Session {
    /// Last text event marked final, if any.
    pub fn last_final_text(&self) -> Option<&str> {
        self.events
            .iter()
            .rev()
            .find(|event| event.is_final)
            .and_then(Event::as_text)
    }
}

/// What `create_session_with` does when the key is already taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CreatePolicy {
    #[default]
    FailIfExists,
    GetOrCreate,
}

/// Owner of sessions. All mutation goes through [`SessionService::append_event`].
#[async_trait]
pub trait SessionService: Send + Sync {
    /// Create a session under `policy`. Initial state may target any
    /// persistent scope; `temp:` keys are rejected.
    async fn create_session_with(
        &self,
        key: &SessionKey,
        initial_state: Option<StateDelta>,
        policy: CreatePolicy,
    ) -> Result<Session, TurnloopError>;

    /// Create a session, failing with `AlreadyExists` if the key is in use.
    async fn create_session(
        &self,
        key: &SessionKey,
        initial_state: Option<StateDelta>,
    ) -> Result<Session, TurnloopError> {
        self.create_session_with(key, initial_state, CreatePolicy::FailIfExists)
            .await
    }

    async fn get_session(&self, key: &SessionKey) -> Result<Session, TurnloopError>;

    /// Keys of every session for a user within an app, sorted by id.
    async fn list_sessions(
        &self,
        app_name: &str,
        user_id: &str,
    ) -> Result<Vec<SessionKey>, TurnloopError>;

    async fn delete_session(&self, key: &SessionKey) -> Result<(), TurnloopError>;

    /// Append an event, applying its state delta atomically. Returns the
    /// event's sequence number.
    async fn append_event(&self, key: &SessionKey, event: Event) -> Result<u64, TurnloopError>;

    /// Events with `seq >= offset`.
    async fn events_since(
        &self,
        key: &SessionKey,
        offset: u64,
    ) -> Result<Vec<Event>, TurnloopError>;

    /// Drop all `temp:` keys from the session. Returns how many were removed.
    async fn clear_temp_state(&self, key: &SessionKey) -> Result<usize, TurnloopError>;
}
