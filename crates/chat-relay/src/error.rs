//! Error types for chat-relay

use thiserror::Error;

use crate::types::ConversationId;

/// Result type alias using chat-relay Error
pub type Result<T> = std::result::Result<T, Error>;

/// Maximum number of characters of an error body kept in [`Error::Status`]
pub(crate) const BODY_PREVIEW_CHARS: usize = 800;

/// Errors that can occur while relaying a completion
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid credential, model or endpoint. Raised before any
    /// network call.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// HTTP request failed (connect, timeout, body read)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Endpoint answered with a non-2xx status
    #[error("HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Response body was valid JSON but not the expected shape
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Provider answered with an error object instead of a completion
    #[error("API error: {message} (type: {error_type})")]
    Api { error_type: String, message: String },

    /// The response stream broke mid-turn
    #[error("Stream error: {0}")]
    Stream(String),

    /// A turn is already streaming for this conversation
    #[error("A reply is already streaming for conversation {0}")]
    TurnInProgress(ConversationId),

    /// A streamed turn was started outside a Tokio runtime
    #[error("No async runtime: {0}")]
    Runtime(String),

    /// The turn was aborted by the caller
    #[error("Request cancelled")]
    Cancelled,
}

impl Error {
    /// Create an API error from type and message
    pub fn api(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// Create a status error, keeping only a bounded preview of the body
    pub fn status(status: u16, body: &str) -> Self {
        Self::Status {
            status,
            body: body.trim().chars().take(BODY_PREVIEW_CHARS).collect(),
        }
    }

    /// Check if this is a configuration error
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_))
    }

    /// Check if this error is worth retrying.
    ///
    /// The relay never retries on its own; this is for callers that want to.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(e) => e.is_timeout() || e.is_connect(),
            Error::Stream(_) => true,
            Error::Status { status, .. } => *status == 429 || *status >= 500,
            Error::Api {
                error_type,
                message,
            } => {
                let et = error_type.to_lowercase();
                let msg = message.to_lowercase();
                et.contains("rate_limit")
                    || et.contains("overloaded")
                    || msg.contains("rate limit")
                    || msg.contains("overloaded")
                    || msg.contains("too many requests")
            }
            _ => false,
        }
    }
}
