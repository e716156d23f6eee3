//! JSON-RPC 2.0 framing for newline-delimited stdio.
//!
//! Only the envelope lives here; payloads and error objects are the
//! `rmcp::model` types.

use rmcp::model::ErrorData;
use serde::{Deserialize, Serialize};

use crate::error::TurnloopError;

pub const JSONRPC_VERSION: &str = "2.0";

/// Request identifier: numeric or string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<ErrorData> for TurnloopError {
    fn from(error: ErrorData) -> Self {
        TurnloopError::Rpc {
            code: i64::from(error.code.0),
            message: error.message.into_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: &'a RequestId,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a serde_json::Value>,
}

impl<'a> Request<'a> {
    pub fn new(id: &'a RequestId, method: &'a str, params: Option<&'a serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a serde_json::Value>,
}

impl<'a> Notification<'a> {
    pub fn new(method: &'a str, params: Option<&'a serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Response<'a> {
    pub jsonrpc: &'static str,
    pub id: &'a RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorData>,
}

impl<'a> Response<'a> {
    pub fn success(id: &'a RequestId, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: &'a RequestId, error: ErrorData) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone)]
pub enum Incoming {
    Response {
        id: RequestId,
        outcome: Result<serde_json::Value, ErrorData>,
    },
    Request {
        id: RequestId,
        method: String,
        params: Option<serde_json::Value>,
    },
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
    /// Well-formed JSON that is not a usable JSON-RPC message.
    Invalid(String),
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<RequestId>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<serde_json::Value>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<ErrorData>,
}

/// Decode one line. Fails only if the line is not JSON at all.
pub fn decode_line(line: &str) -> Result<Incoming, TurnloopError> {
    let raw: serde_json::Value = serde_json::from_str(line)?;
    if !raw.is_object() {
        return Ok(Incoming::Invalid("frame is not a JSON object".into()));
    }
    let message: RawMessage = match serde_json::from_value(raw) {
        Ok(message) => message,
        Err(err) => return Ok(Incoming::Invalid(err.to_string())),
    };

    Ok(match (message.method, message.id) {
        (Some(method), Some(id)) => Incoming::Request {
            id,
            method,
            params: message.params,
        },
        (Some(method), None) => Incoming::Notification {
            method,
            params: message.params,
        },
        (None, Some(id)) => {
            let outcome = match message.error {
                Some(error) => Err(error),
                None => Ok(message.result.unwrap_or(serde_json::Value::Null)),
            };
            Incoming::Response { id, outcome }
        }
        (None, None) => Incoming::Invalid("frame has neither method nor id".into()),
    })
}

/// Serialize a message as one newline-terminated frame.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, TurnloopError> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}
