//! Typed access to tool call arguments.

use crate::error::TurnloopError;

/// Wrapper around tool call arguments providing typed extraction.
#[derive(Debug, Clone)]
pub struct ToolArguments {
    tool: String,
    value: serde_json::Value,
}

impl ToolArguments {
    pub fn new(value: serde_json::Value) -> Self {
        Self {
            tool: String::new(),
            value,
        }
    }

    /// Arguments addressed to a named tool; extraction errors carry the name.
    pub fn for_tool(tool: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            tool: tool.into(),
            value,
        }
    }

    /// Get the raw JSON value.
    pub fn raw(&self) -> &serde_json::Value {
        &self.value
    }

    pub fn into_raw(self) -> serde_json::Value {
        self.value
    }

    fn missing(&self, kind: &str, key: &str) -> TurnloopError {
        TurnloopError::invalid_arguments(&self.tool, format!("missing {kind} argument: {key}"))
    }

    /// Get a string argument by key.
    pub fn get_str(&self, key: &str) -> Result<&str, TurnloopError> {
        self.value
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| self.missing("string", key))
    }

    /// Get an optional string argument.
    pub fn get_str_opt(&self, key: &str) -> Option<&str> {
        self.value.get(key).and_then(|v| v.as_str())
    }

    /// Get an integer argument.
    pub fn get_i64(&self, key: &str) -> Result<i64, TurnloopError> {
        self.value
            .get(key)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| self.missing("integer", key))
    }

    pub fn get_u64_opt(&self, key: &str) -> Option<u64> {
        self.value.get(key).and_then(|v| v.as_u64())
    }

    /// Get a float argument.
    pub fn get_f64(&self, key: &str) -> Result<f64, TurnloopError> {
        self.value
            .get(key)
            .and_then(|v| v.as_f64())
            .ok_or_else(|| self.missing("number", key))
    }

    /// Get a boolean argument.
    pub fn get_bool(&self, key: &str) -> Result<bool, TurnloopError> {
        self.value
            .get(key)
            .and_then(|v| v.as_bool())
            .ok_or_else(|| self.missing("boolean", key))
    }

    /// Get an array argument.
    pub fn get_array(&self, key: &str) -> Result<&Vec<serde_json::Value>, TurnloopError> {
        self.value
            .get(key)
            .and_then(|v| v.as_array())
            .ok_or_else(|| self.missing("array", key))
    }

    /// Deserialize the entire arguments into a typed struct.
    pub fn deserialize<T: serde::de::DeserializeOwned>(&self) -> Result<T, TurnloopError> {
        serde_json::from_value(self.value.clone()).map_err(|e| {
            TurnloopError::invalid_arguments(&self.tool, format!("failed to deserialize arguments: {e}"))
        })
    }
}

/// Models sometimes send arguments as a JSON-encoded string; decode those.
/// An empty string or `null` means "no arguments".
pub fn normalize_arguments(
    tool: &str,
    value: serde_json::Value,
) -> Result<serde_json::Value, TurnloopError> {
    match value {
        serde_json::Value::Null => Ok(serde_json::json!({})),
        serde_json::Value::String(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(serde_json::json!({}));
            }
            serde_json::from_str(trimmed).map_err(|e| {
                TurnloopError::invalid_arguments(tool, format!("arguments must be valid JSON: {e}"))
            })
        }
        other => Ok(other),
    }
}
