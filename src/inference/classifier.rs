//! Failure classification for retry decisions.
//!
//! Every failed inference call is mapped to an [`ErrorVerdict`]: a category,
//! whether another attempt can help, and an optional server-specified delay.
//! Unrecognized failures fail closed (not retryable).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::InferenceError;

/// Canonical failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Timeout,
    RateLimit,
    Authentication,
    BadRequest,
    Server,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::BadRequest => "bad_request",
            ErrorCategory::Server => "server",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorVerdict {
    pub category: ErrorCategory,
    pub retryable: bool,
    /// Overrides the computed backoff when present (rate-limit case).
    pub suggested_delay: Option<Duration>,
}

impl ErrorVerdict {
    fn retryable(category: ErrorCategory) -> Self {
        Self {
            category,
            retryable: true,
            suggested_delay: None,
        }
    }

    fn fatal(category: ErrorCategory) -> Self {
        Self {
            category,
            retryable: false,
            suggested_delay: None,
        }
    }
}

/// Errors that can be classified for the retry loop.
pub trait Classify {
    fn classify(&self) -> ErrorVerdict;
}

impl Classify for InferenceError {
    fn classify(&self) -> ErrorVerdict {
        classify(self)
    }
}

/// Classify an inference failure. Pure function.
pub fn classify(err: &InferenceError) -> ErrorVerdict {
    match err {
        InferenceError::ConnectionFailed { .. } => ErrorVerdict::retryable(ErrorCategory::Network),
        InferenceError::Timeout { .. } => ErrorVerdict::retryable(ErrorCategory::Timeout),
        InferenceError::HttpError {
            status, retry_after, ..
        } => classify_status(*status, *retry_after),
        InferenceError::ResponseParse { .. }
        | InferenceError::ConfigError { .. }
        | InferenceError::Busy { .. }
        | InferenceError::LocalModel { .. } => ErrorVerdict::fatal(ErrorCategory::Unknown),
    }
}

fn classify_status(status: u16, retry_after: Option<Duration>) -> ErrorVerdict {
    match status {
        429 => ErrorVerdict {
            category: ErrorCategory::RateLimit,
            retryable: true,
            suggested_delay: retry_after,
        },
        401 | 403 => ErrorVerdict::fatal(ErrorCategory::Authentication),
        400..=499 => ErrorVerdict::fatal(ErrorCategory::BadRequest),
        500..=599 => ErrorVerdict::retryable(ErrorCategory::Server),
        _ => ErrorVerdict::fatal(ErrorCategory::Unknown),
    }
}
