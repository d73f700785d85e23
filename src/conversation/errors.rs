//! Conversation store error types.

use thiserror::Error;

/// Errors that can occur during session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Session not found.
    #[error("session not found: '{session_id}'")]
    NotFound { session_id: String },

    /// The message cannot be appended as given.
    #[error("invalid message: {reason}")]
    InvalidMessage { reason: String },

    /// Database operation failed.
    #[error("database error: {reason}")]
    Database { reason: String },

    /// Serialization error.
    #[error("serialization error: {reason}")]
    Serialization { reason: String },
}

impl SessionError {
    pub(crate) fn not_found(session_id: &str) -> Self {
        SessionError::NotFound {
            session_id: session_id.to_string(),
        }
    }
}

impl From<rusqlite::Error> for SessionError {
    fn from(e: rusqlite::Error) -> Self {
        SessionError::Database {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::Serialization {
            reason: e.to_string(),
        }
    }
}
