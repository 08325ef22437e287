//! Inference error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility.

use thiserror::Error;

/// Errors that can occur during inference operations.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the provider failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The provider did not respond within the configured timeout.
    #[error("inference timeout after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// Non-2xx HTTP response from the provider.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// SSE stream parsing or chunk-level error.
    #[error("stream error: {reason}")]
    StreamError { reason: String },

    /// The provider answered with a body we could not interpret.
    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String },

    /// No credential configured for the provider.
    #[error("no API key configured for {provider}")]
    MissingCredential { provider: String },

    /// Configuration error (unknown provider, bad base URL).
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl InferenceError {
    /// Message suitable for a chat error turn.
    ///
    /// Provider error bodies are JSON like `{"error": {"message": "..."}}`;
    /// the inner message is surfaced when present.
    pub fn user_message(&self) -> String {
        match self {
            InferenceError::HttpError { status, body } => {
                match provider_error_message(body) {
                    Some(message) => format!("{message} (HTTP {status})"),
                    None => self.to_string(),
                }
            }
            other => other.to_string(),
        }
    }

    /// Extract the error body text, if this is an `HttpError`.
    pub fn error_body(&self) -> Option<&str> {
        match self {
            InferenceError::HttpError { body, .. } => Some(body),
            _ => None,
        }
    }
}

fn provider_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;
    error
        .get("message")
        .and_then(|m| m.as_str())
        .or_else(|| error.as_str())
        .map(str::to_string)
}
