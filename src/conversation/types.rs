//! Shared types for conversation state.
//!
//! Messages, sessions, and the partial-update and listing types exchanged
//! with the command layer.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::inference::types::Role;

/// Default title for sessions created without one.
pub const DEFAULT_SESSION_TITLE: &str = "New Session";

/// Characters of the last user or assistant message shown in listings.
const PREVIEW_CHARS: usize = 80;

// ─── Messages ────────────────────────────────────────────────────────────────

/// A single turn in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

// ─── Sessions ────────────────────────────────────────────────────────────────

/// A persistent, ordered conversation.
///
/// If `system_message` is set, `messages[0]` is the matching system turn and
/// no other system turn exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub system_message: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Session {
    pub(crate) fn new(title: Option<String>, system_message: Option<String>) -> Self {
        let now = Utc::now();
        let mut session = Self {
            id: Uuid::new_v4().to_string(),
            title: title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SESSION_TITLE.to_string()),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            system_message: None,
            metadata: BTreeMap::new(),
        };
        session.set_system_message(system_message.unwrap_or_default());
        session.updated_at = now;
        session
    }

    /// Bump `updated_at`, never moving it backwards.
    pub(crate) fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    /// Insert, replace, or (when `text` is blank) remove the system turn.
    pub(crate) fn set_system_message(&mut self, text: String) {
        let has_system = self
            .messages
            .first()
            .is_some_and(|m| m.role == Role::System);

        if text.trim().is_empty() {
            if has_system {
                self.messages.remove(0);
            }
            self.system_message = None;
        } else {
            match self.messages.first_mut() {
                Some(first) if has_system => {
                    first.content = text.clone();
                    first.timestamp = Utc::now();
                }
                _ => self.messages.insert(0, Message::new(Role::System, text.clone())),
            }
            self.system_message = Some(text);
        }
        self.touch();
    }

    /// Drop every turn except the system message.
    pub(crate) fn clear_history(&mut self) {
        self.messages.retain(|m| m.role == Role::System);
        self.touch();
    }

    /// Number of user and assistant turns.
    pub fn turn_count(&self) -> usize {
        self.messages.iter().filter(|m| m.role != Role::System).count()
    }

    /// Short excerpt of the latest non-system turn.
    pub fn preview(&self) -> Option<String> {
        let last = self.messages.iter().rev().find(|m| m.role != Role::System)?;
        let flat = last.content.split_whitespace().collect::<Vec<_>>().join(" ");
        if flat.chars().count() <= PREVIEW_CHARS {
            Some(flat)
        } else {
            let cut: String = flat.chars().take(PREVIEW_CHARS).collect();
            Some(format!("{cut}…"))
        }
    }
}

/// Partial session update. `None` fields are left untouched.
///
/// `system_message: Some("")` removes the system turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub system_message: Option<String>,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
}

/// Row in a session listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListItem {
    pub id: String,
    pub title: String,
    pub message_count: usize,
    pub preview: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_active: bool,
}

impl SessionListItem {
    pub(crate) fn from_session(session: &Session, active: Option<&str>) -> Self {
        Self {
            id: session.id.clone(),
            title: session.title.clone(),
            message_count: session.turn_count(),
            preview: session.preview(),
            created_at: session.created_at,
            updated_at: session.updated_at,
            is_active: active == Some(session.id.as_str()),
        }
    }
}
