//! Unified error classification and recovery.

use serde::{Deserialize, Serialize};

/// Broad error category for routing recovery logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    NotFound,
    Conflict,
    InvalidInput,
    InvalidArguments,
    ToolExecution,
    Timeout,
    Cancelled,
    Transport,
    Protocol,
    IterationBound,
    Configuration,
    Network,
    Server,
    Api,
    Serialization,
    Storage,
}

impl ErrorCategory {
    /// Machine-readable reason string carried in tool-error payloads.
    pub fn reason(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Conflict => "already_exists",
            Self::InvalidInput => "invalid_input",
            Self::InvalidArguments => "invalid_arguments",
            Self::ToolExecution => "execution_error",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Transport => "transport_error",
            Self::Protocol => "protocol_error",
            Self::IterationBound => "max_iterations_exceeded",
            Self::Configuration => "configuration_error",
            Self::Network => "network_error",
            Self::Server => "server_error",
            Self::Api => "api_error",
            Self::Serialization => "serialization_error",
            Self::Storage => "storage_error",
        }
    }
}

/// Suggested recovery action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySuggestion {
    FixArguments,
    CheckToolImplementation,
    IncreaseTimeout,
    ReconnectToolset,
    RetryWithBackoff,
    CheckConfiguration,
    RaiseIterationLimit,
    None,
}
