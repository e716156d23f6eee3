//! `{key}` placeholders in agent instructions, filled from session state.
//!
//! `{key}` takes the value stored under `key` (strings verbatim, anything
//! else as JSON). A missing key leaves the placeholder untouched so the
//! gap stays visible in the prompt; `{key?}` renders a missing key as an
//! empty string instead. Braces around anything that is not a state key
//! name, such as JSON examples, are left alone.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::debug;

use crate::state::State;

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{((?:(?:app|user|temp):)?[A-Za-z_][A-Za-z0-9_]*)(\?)?\}")
        .expect("placeholder regex must compile")
});

/// Render `template` against `state`.
pub fn inject_state(template: &str, state: &State) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &Captures<'_>| {
            let key = &caps[1];
            let optional = caps.get(2).is_some();
            match state.get(key) {
                Some(serde_json::Value::String(text)) => text.clone(),
                Some(value) => value.to_string(),
                None if optional => String::new(),
                None => {
                    debug!(key, "instruction placeholder has no state value");
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}
