//! Session management commands.
//!
//! Thin wrappers over [`ConversationStore`](crate::conversation::ConversationStore)
//! that log each mutation and flatten errors to strings.

use crate::conversation::{Session, SessionListItem, SessionUpdate};
use crate::AppState;

/// Create a session and make it active. Returns the new session ID.
pub fn create_session(
    state: &AppState,
    title: Option<String>,
    system_message: Option<String>,
) -> Result<String, String> {
    state
        .store
        .create_session(title, system_message)
        .map_err(|e| format!("Failed to create session: {e}"))
}

/// List sessions, most recently updated first.
pub fn list_sessions(state: &AppState) -> Result<Vec<SessionListItem>, String> {
    Ok(state.store.list_sessions())
}

/// Load a session with its full message history.
pub fn load_session(state: &AppState, session_id: &str) -> Result<Session, String> {
    state.store.get_session(session_id).map_err(|e| format!("{e}"))
}

/// Load the active session, if any.
pub fn get_active_session(state: &AppState) -> Result<Option<Session>, String> {
    Ok(state.store.active_session())
}

pub fn update_session(
    state: &AppState,
    session_id: &str,
    update: SessionUpdate,
) -> Result<Session, String> {
    state
        .store
        .update_session(session_id, update)
        .map_err(|e| format!("Failed to update session: {e}"))
}

/// Delete a session and all its messages.
///
/// If it was active, the most recently updated remaining session takes over.
pub fn delete_session(state: &AppState, session_id: &str) -> Result<(), String> {
    state
        .store
        .delete_session(session_id)
        .map_err(|e| format!("Failed to delete session: {e}"))
}

/// Drop all turns but keep the session and its system message.
pub fn clear_history(state: &AppState, session_id: &str) -> Result<(), String> {
    state
        .store
        .clear_history(session_id)
        .map_err(|e| format!("Failed to clear history: {e}"))
}

pub fn set_active_session(state: &AppState, session_id: &str) -> Result<(), String> {
    state
        .store
        .set_active_session(session_id)
        .map_err(|e| format!("{e}"))
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::types::Role;
    use crate::test_support::test_state;

    #[test]
    fn test_create_makes_session_active() {
        let state = test_state(None, 16_384);
        let first = create_session(&state, Some("First".into()), None).unwrap();
        let second = create_session(&state, None, None).unwrap();

        let active = get_active_session(&state).unwrap().unwrap();
        assert_eq!(active.id, second);

        set_active_session(&state, &first).unwrap();
        assert_eq!(get_active_session(&state).unwrap().unwrap().title, "First");
        assert!(set_active_session(&state, "ghost").is_err());
    }

    #[test]
    fn test_list_marks_active_and_previews() {
        let state = test_state(None, 16_384);
        let id = create_session(&state, None, None).unwrap();
        state
            .store
            .append_message(&id, Role::User, "reverse a linked list")
            .unwrap();

        let items = list_sessions(&state).unwrap();
        assert_eq!(items.len(), 1);
        assert!(items[0].is_active);
        assert_eq!(items[0].message_count, 1);
        assert_eq!(items[0].preview.as_deref(), Some("reverse a linked list"));
    }

    #[test]
    fn test_update_and_load() {
        let state = test_state(None, 16_384);
        let id = create_session(&state, None, None).unwrap();

        let updated = update_session(
            &state,
            &id,
            SessionUpdate {
                title: Some("Parser work".into()),
                system_message: Some("Answer in Rust.".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(updated.title, "Parser work");

        let loaded = load_session(&state, &id).unwrap();
        assert_eq!(loaded.messages[0].role, Role::System);
        assert_eq!(loaded.messages[0].content, "Answer in Rust.");
    }

    #[test]
    fn test_clear_keeps_system_message() {
        let state = test_state(None, 16_384);
        let id = create_session(&state, None, Some("sys".into())).unwrap();
        state.store.append_message(&id, Role::User, "q").unwrap();
        state.store.append_message(&id, Role::Assistant, "a").unwrap();

        clear_history(&state, &id).unwrap();
        let loaded = load_session(&state, &id).unwrap();
        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded.messages[0].role, Role::System);
    }

    #[test]
    fn test_delete_moves_active() {
        let state = test_state(None, 16_384);
        let first = create_session(&state, None, None).unwrap();
        let second = create_session(&state, None, None).unwrap();

        delete_session(&state, &second).unwrap();
        assert_eq!(state.store.active_session_id().as_deref(), Some(first.as_str()));
        assert!(load_session(&state, &second).is_err());
        assert!(delete_session(&state, &second).is_err());
    }
}
