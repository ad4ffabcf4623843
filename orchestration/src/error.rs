//! Orchestration error types.
//!
//! Every error carries a machine-readable [`ErrorKind`] so callers (and the
//! Tool Protocol handler) can react without matching on message text.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tool_protocol::{error_codes, JsonRpcError};

pub type OrchestrationResult<T> = Result<T, OrchestrationError>;

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("Invalid parameters for '{tool_name}': {}", errors.join("; "))]
    Validation {
        tool_name: String,
        errors: Vec<String>,
    },

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Connection to '{target}' failed after {attempts} attempt(s): {message}")]
    Connection {
        target: String,
        message: String,
        attempts: u32,
    },

    #[error("Tool '{tool_name}' failed: {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("External server error: {0}")]
    ExternalServer(String),

    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: String,
        elapsed: Duration,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl OrchestrationError {
    pub fn connection(target: impl Into<String>, message: impl Into<String>) -> Self {
        OrchestrationError::Connection {
            target: target.into(),
            message: message.into(),
            attempts: 1,
        }
    }

    pub fn tool_execution(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        OrchestrationError::ToolExecution {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestrationError::Validation { .. } => ErrorKind::Validation,
            OrchestrationError::ToolNotFound(_) => ErrorKind::ToolNotFound,
            OrchestrationError::Connection { .. }
            | OrchestrationError::Timeout { .. }
            | OrchestrationError::Transport(_)
            | OrchestrationError::Http(_) => ErrorKind::Connection,
            OrchestrationError::ToolExecution { .. } => ErrorKind::ToolExecution,
            OrchestrationError::ExternalServer(_)
            | OrchestrationError::ServerNotFound(_)
            | OrchestrationError::Config(_) => ErrorKind::ExternalServer,
            OrchestrationError::Internal(_)
            | OrchestrationError::Io(_)
            | OrchestrationError::Json(_)
            | OrchestrationError::Yaml(_) => ErrorKind::Internal,
        }
    }

    /// Transport-level failures are worth another attempt; everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestrationError::Connection { .. }
            | OrchestrationError::Timeout { .. }
            | OrchestrationError::Transport(_) => true,
            OrchestrationError::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            _ => false,
        }
    }

    /// Stamp the attempt count onto a retryable error.
    ///
    /// Retryable failures of any variant come back as [`OrchestrationError::Connection`]
    /// so the count survives; terminal errors pass through unchanged.
    #[must_use]
    pub fn with_attempts(self, attempts: u32) -> Self {
        if !self.is_retryable() {
            return self;
        }
        match self {
            OrchestrationError::Connection {
                target, message, ..
            } => OrchestrationError::Connection {
                target,
                message,
                attempts,
            },
            other => {
                let target = match &other {
                    OrchestrationError::Timeout { operation, .. } => operation.clone(),
                    OrchestrationError::Http(e) => e
                        .url()
                        .map(|u| u.to_string())
                        .unwrap_or_else(|| "http".to_string()),
                    _ => "transport".to_string(),
                };
                OrchestrationError::Connection {
                    target,
                    message: other.to_string(),
                    attempts,
                }
            }
        }
    }

    /// Convert into a Tool Protocol error object.
    ///
    /// Internal details are not forwarded for `INTERNAL_ERROR`.
    pub fn to_jsonrpc(&self) -> JsonRpcError {
        let kind = self.kind();
        let code = match kind {
            ErrorKind::Validation | ErrorKind::ToolNotFound => error_codes::INVALID_PARAMS,
            _ => error_codes::INTERNAL_ERROR,
        };
        let message = match kind {
            ErrorKind::Internal => "Internal error".to_string(),
            _ => self.to_string(),
        };
        let mut data = serde_json::json!({ "error_code": kind.as_str() });
        if let OrchestrationError::Validation { errors, .. } = self {
            data["errors"] = serde_json::json!(errors);
        }
        JsonRpcError::new(code, message).with_data(data)
    }
}

/// Machine-readable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Validation,
    ToolNotFound,
    Connection,
    ToolExecution,
    ExternalServer,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::ToolNotFound => "TOOL_NOT_FOUND",
            ErrorKind::Connection => "CONNECTION_ERROR",
            ErrorKind::ToolExecution => "TOOL_EXECUTION_FAILED",
            ErrorKind::ExternalServer => "EXTERNAL_SERVER_ERROR",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
