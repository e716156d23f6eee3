//! Deterministic backend that replays canned responses.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{ModelBackend, ModelRequest, ModelResponse};
use crate::error::TurnloopError;

type Responder = Box<dyn Fn(&ModelRequest) -> Result<ModelResponse, TurnloopError> + Send + Sync>;

enum Script {
    Queue(Mutex<VecDeque<ModelResponse>>),
    Responder(Responder),
}

/// Replays queued responses (or asks a closure) and records every request.
pub struct ScriptedBackend {
    script: Script,
    delay: Option<Duration>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedBackend {
    /// Answer with `responses` in order; fails once they run out.
    pub fn new(responses: impl IntoIterator<Item = ModelResponse>) -> Self {
        Self::with_script(Script::Queue(Mutex::new(responses.into_iter().collect())))
    }

    /// Compute each response from the request.
    pub fn from_fn<F>(responder: F) -> Self
    where
        F: Fn(&ModelRequest) -> Result<ModelResponse, TurnloopError> + Send + Sync + 'static,
    {
        Self::with_script(Script::Responder(Box::new(responder)))
    }

    fn with_script(script: Script) -> Self {
        Self {
            script,
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Sleep before every answer.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Append a response to the queue. No effect on closure scripts.
    pub fn push(&self, response: ModelResponse) {
        if let Script::Queue(queue) = &self.script {
            queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(response);
        }
    }

    /// Every request seen so far.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl std::fmt::Debug for ScriptedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedBackend")
            .field("requests", &self.request_count())
            .finish()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn model_id(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse, TurnloopError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.script {
            Script::Queue(queue) => queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
                .ok_or_else(|| TurnloopError::Model("scripted backend has no responses left".into())),
            Script::Responder(responder) => responder(request),
        }
    }
}
