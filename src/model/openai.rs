//! OpenAI-compatible Chat Completions backend.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use tracing::debug;

use super::{ModelBackend, ModelRequest, ModelResponse};
use crate::error::TurnloopError;
use crate::event::{Event, EventContent, ToolCall, USER_AUTHOR};
use crate::tools::ToolDefinition;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

pub const API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const BASE_URL_ENV: &str = "OPENAI_BASE_URL";
pub const MODEL_ENV: &str = "TURNLOOP_MODEL";

pub struct OpenAiChatBackend {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiChatBackend {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Build from `OPENAI_API_KEY`, `OPENAI_BASE_URL` and `TURNLOOP_MODEL`.
    pub fn from_env() -> Result<Self, TurnloopError> {
        let _ = dotenvy::dotenv();
        let api_key = std::env::var(API_KEY_ENV)
            .map_err(|_| TurnloopError::Configuration(format!("missing {API_KEY_ENV}")))?;
        let model = std::env::var(MODEL_ENV).unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let backend = Self::new(api_key, model);
        Ok(match std::env::var(BASE_URL_ENV) {
            Ok(url) if !url.is_empty() => backend.with_base_url(url),
            _ => backend,
        })
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", self.api_key)) {
            headers.insert(AUTHORIZATION, value);
        }
        headers
    }

    fn build_request_body(&self, request: &ModelRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": history_to_messages(request.instruction.as_deref(), &request.history),
        });
        if !request.tools.is_empty() {
            let tools: Vec<serde_json::Value> = request.tools.iter().map(tool_to_function).collect();
            body["tools"] = tools.into();
        }
        body
    }
}

impl std::fmt::Debug for OpenAiChatBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiChatBackend")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[async_trait]
impl ModelBackend for OpenAiChatBackend {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse, TurnloopError> {
        let body = self.build_request_body(request);
        let url = format!("{}/chat/completions", self.base_url);
        debug!(model = %self.model, history = request.history.len(), tools = request.tools.len(), "chat completion");

        let resp = self
            .client
            .post(&url)
            .headers(self.headers())
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let message = resp.text().await.unwrap_or_default();
            return Err(TurnloopError::Api { status, message });
        }

        let data: ChatResponse = resp.json().await?;
        let choice = data.choices.into_iter().next().ok_or_else(|| TurnloopError::Api {
            status,
            message: "no choices in chat completion".into(),
        })?;
        Ok(choice_to_response(choice))
    }
}

fn choice_to_response(choice: ChatChoice) -> ModelResponse {
    if choice.finish_reason.as_deref() == Some("content_filter") {
        return ModelResponse::escalate("response blocked by the provider's content filter");
    }

    let text = choice.message.content.filter(|text| !text.is_empty());
    let calls: Vec<ToolCall> = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| {
            let arguments = serde_json::from_str(&call.function.arguments)
                .unwrap_or(serde_json::Value::String(call.function.arguments));
            ToolCall::new(call.id, call.function.name, arguments)
        })
        .collect();

    if calls.is_empty() {
        ModelResponse::Text(text.unwrap_or_default())
    } else {
        ModelResponse::ToolCalls { text, calls }
    }
}

fn tool_to_function(tool: &ToolDefinition) -> serde_json::Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.input_schema,
        }
    })
}

/// Chat messages for a session history. Consecutive tool calls fold into
/// the preceding assistant message; results become `tool` messages.
fn history_to_messages(instruction: Option<&str>, history: &[Event]) -> Vec<serde_json::Value> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    if let Some(instruction) = instruction.filter(|text| !text.is_empty()) {
        messages.push(serde_json::json!({ "role": "system", "content": instruction }));
    }

    for event in history {
        match &event.content {
            EventContent::Text { text } => {
                let role = if event.author == USER_AUTHOR { "user" } else { "assistant" };
                messages.push(serde_json::json!({ "role": role, "content": text }));
            }
            EventContent::ToolCall(call) => {
                let entry = serde_json::json!({
                    "id": call.call_id,
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": call.arguments.to_string(),
                    }
                });
                match messages.last_mut() {
                    Some(last) if last["role"] == "assistant" => {
                        match last.get_mut("tool_calls").and_then(|calls| calls.as_array_mut()) {
                            Some(calls) => calls.push(entry),
                            None => last["tool_calls"] = serde_json::json!([entry]),
                        }
                    }
                    _ => messages.push(serde_json::json!({
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [entry],
                    })),
                }
            }
            EventContent::ToolResult(result) => {
                let content = match result.outcome.to_payload() {
                    serde_json::Value::String(text) => text,
                    other => other.to_string(),
                };
                messages.push(serde_json::json!({
                    "role": "tool",
                    "tool_call_id": result.call_id,
                    "content": content,
                }));
            }
        }
    }
    messages
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ChatToolCall>>,
}

#[derive(Deserialize)]
struct ChatToolCall {
    id: String,
    function: ChatFunction,
}

#[derive(Deserialize)]
struct ChatFunction {
    name: String,
    arguments: String,
}
