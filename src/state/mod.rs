//! Namespaced session state and delta application.
//!
//! Keys carry their lifetime in a prefix: no prefix is session-local,
//! `user:` spans all sessions of a user within an app, `app:` spans the
//! whole app and `temp:` lives for a single turn.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};

use crate::error::TurnloopError;

pub const USER_PREFIX: &str = "user:";
pub const APP_PREFIX: &str = "app:";
pub const TEMP_PREFIX: &str = "temp:";

/// Raw key/value storage for one scope.
pub type StateMap = BTreeMap<String, Value>;

/// Lifetime of a state key, derived from its prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum StateScope {
    Session,
    User,
    App,
    Temp,
}

impl StateScope {
    /// Resolve the scope of a key.
    pub fn of(key: &str) -> Self {
        if key.starts_with(USER_PREFIX) {
            Self::User
        } else if key.starts_with(APP_PREFIX) {
            Self::App
        } else if key.starts_with(TEMP_PREFIX) {
            Self::Temp
        } else {
            Self::Session
        }
    }

    pub fn prefix(self) -> &'static str {
        match self {
            Self::Session => "",
            Self::User => USER_PREFIX,
            Self::App => APP_PREFIX,
            Self::Temp => TEMP_PREFIX,
        }
    }

    /// Whether values in this scope may be written to a persistent store.
    pub fn is_persistent(self) -> bool {
        !matches!(self, Self::Temp)
    }
}

/// Merged, read-only view of a session's state across all scopes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State(StateMap);

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the view a session sees: session and temp keys as stored,
    /// app and user keys re-prefixed.
    pub fn merged(app: &StateMap, user: &StateMap, session: &StateMap) -> Self {
        let mut merged = session.clone();
        for (key, value) in app {
            merged.insert(format!("{APP_PREFIX}{key}"), value.clone());
        }
        for (key, value) in user {
            merged.insert(format!("{USER_PREFIX}{key}"), value.clone());
        }
        Self(merged)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Deserialize a value into a typed shape.
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.0
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Apply a delta to this view in place (used for tool snapshots).
    pub fn apply(&mut self, delta: &StateDelta) {
        for (key, value) in delta.iter() {
            apply_entry(&mut self.0, key, value.as_ref());
        }
    }

    pub fn into_inner(self) -> StateMap {
        self.0
    }
}

/// A set of state writes attached to an event.
///
/// A `None` (or JSON `null`) value deletes the key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateDelta(BTreeMap<String, Option<Value>>);

impl StateDelta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style write.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Builder-style delete.
    pub fn without(mut self, key: impl Into<String>) -> Self {
        self.remove(key);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), Some(value.into()));
    }

    pub fn remove(&mut self, key: impl Into<String>) {
        self.0.insert(key.into(), None);
    }

    pub fn get(&self, key: &str) -> Option<&Option<Value>> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Option<Value>)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fold another delta into this one; later writes win.
    pub fn extend(&mut self, other: StateDelta) {
        self.0.extend(other.0);
    }

    /// Copy without `temp:` keys.
    pub fn persistent(&self) -> StateDelta {
        Self(
            self.0
                .iter()
                .filter(|(key, _)| StateScope::of(key).is_persistent())
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        )
    }

    pub fn has_scope(&self, scope: StateScope) -> bool {
        self.0.keys().any(|key| StateScope::of(key) == scope)
    }

    /// Reject malformed keys before anything is applied.
    pub fn validate(&self) -> Result<(), TurnloopError> {
        for key in self.0.keys() {
            if key.is_empty() {
                return Err(TurnloopError::InvalidState("empty state key".into()));
            }
            let scope = StateScope::of(key);
            if key.len() == scope.prefix().len() {
                return Err(TurnloopError::InvalidState(format!(
                    "state key '{key}' has a scope prefix but no name"
                )));
            }
        }
        Ok(())
    }

    /// Partition by scope. App and user keys lose their prefix; session
    /// and temp keys are kept verbatim since they live in the session map.
    pub fn split(&self) -> ScopedDelta {
        let mut scoped = ScopedDelta::default();
        for (key, value) in &self.0 {
            let scope = StateScope::of(key);
            let target = match scope {
                StateScope::App => &mut scoped.app,
                StateScope::User => &mut scoped.user,
                StateScope::Session => &mut scoped.session,
                StateScope::Temp => &mut scoped.temp,
            };
            let stored_key = match scope {
                StateScope::App | StateScope::User => key[scope.prefix().len()..].to_string(),
                _ => key.clone(),
            };
            target.insert(stored_key, value.clone());
        }
        scoped
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for StateDelta {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), Some(value.into())))
                .collect(),
        )
    }
}

/// A delta partitioned by storage location.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopedDelta {
    pub app: BTreeMap<String, Option<Value>>,
    pub user: BTreeMap<String, Option<Value>>,
    pub session: BTreeMap<String, Option<Value>>,
    pub temp: BTreeMap<String, Option<Value>>,
}

impl ScopedDelta {
    /// Apply every partition to its map. Infallible: callers validate the
    /// originating delta first so application is all-or-nothing.
    pub fn apply_to(&self, app: &mut StateMap, user: &mut StateMap, session: &mut StateMap) {
        for (key, value) in &self.app {
            apply_entry(app, key, value.as_ref());
        }
        for (key, value) in &self.user {
            apply_entry(user, key, value.as_ref());
        }
        for (key, value) in self.session.iter().chain(self.temp.iter()) {
            apply_entry(session, key, value.as_ref());
        }
    }
}

fn apply_entry(map: &mut StateMap, key: &str, value: Option<&Value>) {
    match value {
        Some(value) if !value.is_null() => {
            map.insert(key.to_string(), value.clone());
        }
        _ => {
            map.remove(key);
        }
    }
}

/// Drop every `temp:` key from a session map.
pub fn clear_temp(session: &mut StateMap) -> usize {
    let before = session.len();
    session.retain(|key, _| StateScope::of(key) != StateScope::Temp);
    before - session.len()
}

/// Copy of a session map without turn-transient keys, for persistence.
pub fn persistent_view(session: &StateMap) -> StateMap {
    session
        .iter()
        .filter(|(key, _)| StateScope::of(key).is_persistent())
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}
