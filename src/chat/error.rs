//! Error types for the chat pipeline and the language model adapter

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced to callers submitting a turn
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChatError {
    /// Message was empty after trimming
    #[error("Message must not be empty")]
    EmptyMessage,

    /// Another turn is in flight and the busy policy rejects new ones
    #[error("Session {0} is busy with another turn")]
    SessionBusy(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// The consumer went away before the turn finished
    #[error("Turn was cancelled")]
    Cancelled,
}

/// Errors specific to language model provider operations
#[derive(Debug, Error)]
pub enum LlmError {
    /// API error
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Rate limited
    #[error("Rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Authentication error
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// Streaming error
    #[error("Streaming error: {0}")]
    Streaming(String),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Invalid request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Timeout
    #[error("Request timed out")]
    Timeout,
}

impl LlmError {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } | LlmError::Network(_) | LlmError::Timeout => true,
            LlmError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Server-suggested wait before retrying
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited { retry_after_ms } => Some(Duration::from_millis(*retry_after_ms)),
            _ => None,
        }
    }

    /// Short label used for metrics
    pub fn label(&self) -> &'static str {
        match self {
            LlmError::Api { .. } => "api",
            LlmError::RateLimited { .. } => "rate_limited",
            LlmError::Authentication(_) => "authentication",
            LlmError::Network(_) => "network",
            LlmError::Streaming(_) => "streaming",
            LlmError::Parse(_) => "parse",
            LlmError::InvalidRequest(_) => "invalid_request",
            LlmError::Timeout => "timeout",
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else if err.is_connect() {
            LlmError::Network(format!("Connection error: {}", err))
        } else {
            LlmError::Network(err.to_string())
        }
    }
}

/// Result type alias for LLM operations
pub type LlmResult<T> = Result<T, LlmError>;
