//! Inference error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility. These types carry the context needed to build
//! log entries and to classify the failure for retry decisions.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during inference operations.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the endpoint never completed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The endpoint did not respond within the transport deadline.
    #[error("inference timeout after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// Non-2xx HTTP response from the endpoint.
    ///
    /// `retry_after` carries the server-specified delay (from the
    /// `Retry-After` header) when the provider sent one.
    #[error("HTTP {status}: {body}")]
    HttpError {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },

    /// The endpoint answered 2xx but the body could not be understood.
    #[error("response parse error: {reason}")]
    ResponseParse { reason: String },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// Local admission control rejected the request.
    #[error("local model busy: {reason}")]
    Busy { reason: String },

    /// The local model backend failed.
    #[error("local model error: {reason}")]
    LocalModel { reason: String },
}

impl InferenceError {
    /// Shorthand for an `HttpError` without a retry hint.
    pub fn http(status: u16, body: impl Into<String>) -> Self {
        InferenceError::HttpError {
            status,
            body: body.into(),
            retry_after: None,
        }
    }

    /// The HTTP status code, if this is an `HttpError`.
    pub fn status(&self) -> Option<u16> {
        match self {
            InferenceError::HttpError { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Extract the error body text, if this is an `HttpError`.
    pub fn error_body(&self) -> Option<&str> {
        match self {
            InferenceError::HttpError { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Whether this error means the system is not set up to serve the request.
    pub fn is_config_error(&self) -> bool {
        matches!(self, InferenceError::ConfigError { .. })
    }
}

/// Convert a `reqwest` send error into the matching variant.
pub(crate) fn from_transport_error(endpoint: &str, timeout: Duration, e: reqwest::Error) -> InferenceError {
    if e.is_timeout() {
        InferenceError::Timeout {
            duration_secs: timeout.as_secs(),
        }
    } else {
        InferenceError::ConnectionFailed {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_http_error() {
        let err = InferenceError::http(503, "unavailable");
        assert_eq!(err.status(), Some(503));
        assert_eq!(err.error_body(), Some("unavailable"));
    }

    #[test]
    fn test_status_non_http() {
        let err = InferenceError::Timeout { duration_secs: 5 };
        assert!(err.status().is_none());
        assert!(err.error_body().is_none());
    }

    #[test]
    fn test_display_includes_context() {
        let err = InferenceError::ConnectionFailed {
            endpoint: "https://api.example.com/v1".into(),
            reason: "dns failure".into(),
        };
        let text = err.to_string();
        assert!(text.contains("api.example.com"));
        assert!(text.contains("dns failure"));
    }

    #[test]
    fn test_is_config_error() {
        assert!(InferenceError::ConfigError { reason: "x".into() }.is_config_error());
        assert!(!InferenceError::Busy { reason: "x".into() }.is_config_error());
    }
}
