//! Error types for turnloop.

pub mod unified;

pub use unified::{ErrorCategory, RecoverySuggestion};

use thiserror::Error;

/// Boxed underlying cause carried by wrapped failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Primary error type for all turnloop operations.
#[derive(Error, Debug)]
pub enum TurnloopError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Duplicate tool: {0}")]
    DuplicateTool(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid tool definition '{tool_name}': {message}")]
    InvalidToolDefinition { tool_name: String, message: String },

    #[error("Invalid arguments for '{tool_name}': {message}")]
    InvalidArguments { tool_name: String, message: String },

    #[error("Tool execution error: {tool_name}: {message}")]
    ExecutionError {
        tool_name: String,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Tool loop exceeded max iterations ({0})")]
    MaxIterationsExceeded(usize),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Model backend error: {0}")]
    Model(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TurnloopError {
    /// Wrap a tool body failure, keeping the original cause.
    pub fn execution(tool_name: impl Into<String>, source: impl Into<BoxError>) -> Self {
        let source = source.into();
        Self::ExecutionError {
            tool_name: tool_name.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Tool body failure with a plain message and no underlying cause.
    pub fn execution_message(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExecutionError {
            tool_name: tool_name.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn invalid_arguments(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArguments {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound(_) | Self::ToolNotFound(_) => ErrorCategory::NotFound,
            Self::AlreadyExists(_) | Self::DuplicateTool(_) => ErrorCategory::Conflict,
            Self::InvalidArguments { .. } => ErrorCategory::InvalidArguments,
            Self::InvalidToolDefinition { .. } | Self::InvalidEvent(_) => {
                ErrorCategory::InvalidInput
            }
            Self::ExecutionError { .. } => ErrorCategory::ToolExecution,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Cancelled(_) => ErrorCategory::Cancelled,
            Self::Spawn { .. } | Self::Transport(_) => ErrorCategory::Transport,
            Self::Rpc { .. } => ErrorCategory::Protocol,
            Self::MaxIterationsExceeded(_) => ErrorCategory::IterationBound,
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Network(_) => ErrorCategory::Network,
            Self::Api { status, .. } => match status {
                500..=599 => ErrorCategory::Server,
                _ => ErrorCategory::Api,
            },
            Self::Model(_) => ErrorCategory::Api,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Io(_) | Self::Store(_) | Self::InvalidState(_) => ErrorCategory::Storage,
        }
    }

    /// Whether a failure of this kind, raised by a tool dispatch, can be
    /// reported back to the model instead of ending the turn.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self.category(), ErrorCategory::IterationBound)
    }

    /// Whether this failure poisons the remote toolset it came from.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self.category(), ErrorCategory::Transport)
    }

    /// Stable machine-readable reason used in tool-error payloads.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::ToolNotFound(_) => "tool_not_found",
            other => other.category().reason(),
        }
    }

    /// Suggest recovery actions.
    pub fn recovery_suggestion(&self) -> RecoverySuggestion {
        match self.category() {
            ErrorCategory::InvalidArguments => RecoverySuggestion::FixArguments,
            ErrorCategory::ToolExecution => RecoverySuggestion::CheckToolImplementation,
            ErrorCategory::Timeout => RecoverySuggestion::IncreaseTimeout,
            ErrorCategory::Transport | ErrorCategory::Protocol => {
                RecoverySuggestion::ReconnectToolset
            }
            ErrorCategory::Network | ErrorCategory::Server => RecoverySuggestion::RetryWithBackoff,
            ErrorCategory::Configuration => RecoverySuggestion::CheckConfiguration,
            ErrorCategory::IterationBound => RecoverySuggestion::RaiseIterationLimit,
            _ => RecoverySuggestion::None,
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, TurnloopError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err = TurnloopError::execution("save_file", io);

        assert_eq!(err.reason(), "execution_error");
        let source = std::error::Error::source(&err).expect("source should be kept");
        assert!(source.to_string().contains("disk on fire"));
    }

    #[test]
    fn transport_failures_are_flagged() {
        let err = TurnloopError::Transport("pipe closed".into());
        assert!(err.is_transport_failure());
        assert_eq!(err.reason(), "transport_error");
        assert_eq!(
            err.recovery_suggestion(),
            RecoverySuggestion::ReconnectToolset
        );
    }

    #[test]
    fn iteration_bound_is_not_recoverable() {
        assert!(!TurnloopError::MaxIterationsExceeded(3).is_recoverable());
        assert!(TurnloopError::Timeout(50).is_recoverable());
    }

    #[test]
    fn reasons_distinguish_timeout_and_cancel() {
        assert_eq!(TurnloopError::Timeout(10).reason(), "timeout");
        assert_eq!(TurnloopError::Cancelled("turn".into()).reason(), "cancelled");
        assert_eq!(
            TurnloopError::invalid_arguments("t", "missing field").reason(),
            "invalid_arguments"
        );
        assert_eq!(TurnloopError::ToolNotFound("x".into()).reason(), "tool_not_found");
    }
}
