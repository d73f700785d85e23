//! ConversationStore: the single owner of chat sessions.
//!
//! All session state lives behind one mutex. Every mutation is applied to a
//! copy of the session, written to the database, and only then committed to
//! memory, so a failed write leaves both sides unchanged. Reads hand out
//! clones.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Mutex as TokioMutex;

use super::database::{ChangeSet, SessionDatabase};
use super::errors::SessionError;
use super::types::{Message, Session, SessionListItem, SessionUpdate};
use crate::inference::types::Role;

struct StoreState {
    sessions: HashMap<String, Session>,
    active: Option<String>,
    db: Option<SessionDatabase>,
}

impl StoreState {
    fn session(&self, id: &str) -> Result<&Session, SessionError> {
        self.sessions.get(id).ok_or_else(|| SessionError::not_found(id))
    }

    fn persist(&mut self, changes: ChangeSet<'_>) -> Result<(), SessionError> {
        match self.db.as_mut() {
            Some(db) => db.write_changes(&changes),
            None => Ok(()),
        }
    }

    /// Id of the most recently updated session, excluding `skip`.
    fn most_recent(&self, skip: &str) -> Option<String> {
        self.sessions
            .values()
            .filter(|s| s.id != skip)
            .max_by_key(|s| s.updated_at)
            .map(|s| s.id.clone())
    }

    /// Persist `updated` and swap it into the map.
    fn commit(&mut self, updated: Session) -> Result<(), SessionError> {
        let active = self.active.clone();
        self.persist(ChangeSet {
            upserted: vec![&updated],
            deleted: vec![],
            active: active.as_deref(),
        })?;
        self.sessions.insert(updated.id.clone(), updated);
        Ok(())
    }
}

pub struct ConversationStore {
    state: Mutex<StoreState>,
    session_locks: Mutex<HashMap<String, Arc<TokioMutex<()>>>>,
}

impl ConversationStore {
    /// A store with no backing file.
    pub fn in_memory() -> Self {
        Self::from_parts(HashMap::new(), None, None)
    }

    /// Open the database at `path` and load every session from it.
    pub fn open(path: &Path) -> Result<Self, SessionError> {
        let db = SessionDatabase::open(&path.to_string_lossy())?;
        Self::with_database(db)
    }

    pub fn with_database(db: SessionDatabase) -> Result<Self, SessionError> {
        let sessions: HashMap<String, Session> = db
            .load_sessions()?
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();
        let active = db
            .active_session_id()?
            .filter(|id| sessions.contains_key(id));

        tracing::info!(
            sessions = sessions.len(),
            active = active.as_deref().unwrap_or("none"),
            "conversation store loaded"
        );
        Ok(Self::from_parts(sessions, active, Some(db)))
    }

    fn from_parts(
        sessions: HashMap<String, Session>,
        active: Option<String>,
        db: Option<SessionDatabase>,
    ) -> Self {
        Self {
            state: Mutex::new(StoreState {
                sessions,
                active,
                db,
            }),
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        // Memory is only committed after a successful write, so a poisoned
        // lock still guards consistent state.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ─── Mutations ──────────────────────────────────────────────────────

    /// Create a session; it becomes the active one.
    pub fn create_session(
        &self,
        title: Option<String>,
        system_message: Option<String>,
    ) -> Result<String, SessionError> {
        let session = Session::new(title, system_message);
        let id = session.id.clone();

        let mut state = self.lock();
        state.persist(ChangeSet {
            upserted: vec![&session],
            deleted: vec![],
            active: Some(&id),
        })?;
        state.sessions.insert(id.clone(), session);
        state.active = Some(id.clone());

        tracing::info!(session_id = %id, "session created");
        Ok(id)
    }

    /// Append a user or assistant turn.
    ///
    /// System turns go through [`update_session`](Self::update_session).
    pub fn append_message(
        &self,
        session_id: &str,
        role: Role,
        content: impl Into<String>,
    ) -> Result<Message, SessionError> {
        if role == Role::System {
            return Err(SessionError::InvalidMessage {
                reason: "system messages are set with update_session".into(),
            });
        }

        let mut state = self.lock();
        let mut updated = state.session(session_id)?.clone();
        let message = Message::new(role, content);
        updated.messages.push(message.clone());
        updated.touch();
        state.commit(updated)?;

        tracing::debug!(
            session_id,
            message_id = %message.id,
            role = role.as_str(),
            "message appended"
        );
        Ok(message)
    }

    pub fn update_session(
        &self,
        session_id: &str,
        update: SessionUpdate,
    ) -> Result<Session, SessionError> {
        let mut state = self.lock();
        let mut updated = state.session(session_id)?.clone();

        if let Some(title) = update.title {
            updated.title = title;
        }
        if let Some(metadata) = update.metadata {
            updated.metadata = metadata;
        }
        if let Some(system) = update.system_message {
            updated.set_system_message(system);
        }
        updated.touch();

        state.commit(updated.clone())?;
        tracing::info!(session_id, "session updated");
        Ok(updated)
    }

    /// Remove a session. If it was active, the most recently updated
    /// remaining session becomes active.
    pub fn delete_session(&self, session_id: &str) -> Result<(), SessionError> {
        let mut state = self.lock();
        state.session(session_id)?;

        let next_active = if state.active.as_deref() == Some(session_id) {
            state.most_recent(session_id)
        } else {
            state.active.clone()
        };
        state.persist(ChangeSet {
            upserted: vec![],
            deleted: vec![session_id],
            active: next_active.as_deref(),
        })?;
        state.sessions.remove(session_id);
        state.active = next_active;
        drop(state);

        self.session_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(session_id);

        tracing::info!(session_id, "session deleted");
        Ok(())
    }

    /// Remove every turn except the system message.
    pub fn clear_history(&self, session_id: &str) -> Result<(), SessionError> {
        let mut state = self.lock();
        let mut updated = state.session(session_id)?.clone();
        updated.clear_history();
        state.commit(updated)?;

        tracing::info!(session_id, "session history cleared");
        Ok(())
    }

    pub fn set_active_session(&self, session_id: &str) -> Result<(), SessionError> {
        let mut state = self.lock();
        state.session(session_id)?;
        state.persist(ChangeSet {
            upserted: vec![],
            deleted: vec![],
            active: Some(session_id),
        })?;
        state.active = Some(session_id.to_string());
        Ok(())
    }

    // ─── Reads ──────────────────────────────────────────────────────────

    pub fn get_session(&self, session_id: &str) -> Result<Session, SessionError> {
        self.lock().session(session_id).cloned()
    }

    /// All sessions, most recently updated first.
    pub fn list_sessions(&self) -> Vec<SessionListItem> {
        let state = self.lock();
        let mut items: Vec<SessionListItem> = state
            .sessions
            .values()
            .map(|s| SessionListItem::from_session(s, state.active.as_deref()))
            .collect();
        items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        items
    }

    pub fn active_session_id(&self) -> Option<String> {
        self.lock().active.clone()
    }

    pub fn active_session(&self) -> Option<Session> {
        let state = self.lock();
        let id = state.active.as_deref()?;
        state.sessions.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-session async lock serializing multi-step flows (send-message)
    /// on one session. Different sessions never contend.
    pub fn session_lock(&self, session_id: &str) -> Arc<TokioMutex<()>> {
        let mut locks = self
            .session_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(session_id.to_string()).or_default())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_create_session_becomes_active() {
        let store = ConversationStore::in_memory();
        let a = store.create_session(Some("a".into()), None).unwrap();
        assert_eq!(store.active_session_id().as_deref(), Some(a.as_str()));

        let b = store.create_session(None, None).unwrap();
        assert_eq!(store.active_session_id().as_deref(), Some(b.as_str()));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_append_preserves_order() {
        let store = ConversationStore::in_memory();
        let id = store.create_session(None, Some("sys".into())).unwrap();

        for i in 0..10 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            store.append_message(&id, role, format!("turn {i}")).unwrap();
        }

        let session = store.get_session(&id).unwrap();
        assert_eq!(session.messages.len(), 11);
        assert_eq!(session.messages[0].role, Role::System);
        for (i, msg) in session.messages[1..].iter().enumerate() {
            assert_eq!(msg.content, format!("turn {i}"));
        }
    }

    #[test]
    fn test_append_to_missing_session() {
        let store = ConversationStore::in_memory();
        let err = store.append_message("nope", Role::User, "hi").unwrap_err();
        assert!(matches!(err, SessionError::NotFound { .. }));
    }

    #[test]
    fn test_append_system_role_rejected() {
        let store = ConversationStore::in_memory();
        let id = store.create_session(None, None).unwrap();
        let err = store.append_message(&id, Role::System, "sneaky").unwrap_err();
        assert!(matches!(err, SessionError::InvalidMessage { .. }));
        assert!(store.get_session(&id).unwrap().messages.is_empty());
    }

    #[test]
    fn test_updated_at_is_monotonic() {
        let store = ConversationStore::in_memory();
        let id = store.create_session(None, None).unwrap();
        let mut last = store.get_session(&id).unwrap().updated_at;

        for i in 0..20 {
            store.append_message(&id, Role::User, format!("{i}")).unwrap();
            let now = store.get_session(&id).unwrap().updated_at;
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn test_update_session_fields() {
        let store = ConversationStore::in_memory();
        let id = store.create_session(None, None).unwrap();
        store.append_message(&id, Role::User, "hello").unwrap();

        let mut metadata = BTreeMap::new();
        metadata.insert("language".to_string(), serde_json::json!("python"));
        let updated = store
            .update_session(
                &id,
                SessionUpdate {
                    title: Some("Renamed".into()),
                    system_message: Some("You are terse.".into()),
                    metadata: Some(metadata.clone()),
                },
            )
            .unwrap();

        assert_eq!(updated.title, "Renamed");
        assert_eq!(updated.metadata, metadata);
        assert_eq!(updated.messages[0].role, Role::System);
        assert_eq!(updated.messages[1].content, "hello");

        let cleared = store
            .update_session(
                &id,
                SessionUpdate {
                    system_message: Some(String::new()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(cleared.system_message.is_none());
        assert_eq!(cleared.messages.len(), 1);
        assert_eq!(cleared.title, "Renamed");
    }

    #[test]
    fn test_delete_active_moves_to_most_recent() {
        let store = ConversationStore::in_memory();
        let a = store.create_session(Some("a".into()), None).unwrap();
        let b = store.create_session(Some("b".into()), None).unwrap();
        let c = store.create_session(Some("c".into()), None).unwrap();

        // `a` becomes the most recently updated.
        store.append_message(&a, Role::User, "bump").unwrap();
        store.set_active_session(&b).unwrap();

        store.delete_session(&b).unwrap();
        assert_eq!(store.active_session_id().as_deref(), Some(a.as_str()));

        store.delete_session(&c).unwrap();
        assert_eq!(store.active_session_id().as_deref(), Some(a.as_str()));

        store.delete_session(&a).unwrap();
        assert_eq!(store.active_session_id(), None);
        assert!(store.is_empty());
        assert!(store.active_session().is_none());
    }

    #[test]
    fn test_delete_missing_session() {
        let store = ConversationStore::in_memory();
        assert!(matches!(
            store.delete_session("ghost").unwrap_err(),
            SessionError::NotFound { .. }
        ));
    }

    #[test]
    fn test_clear_history_keeps_system_message() {
        let store = ConversationStore::in_memory();
        let id = store.create_session(None, Some("sys".into())).unwrap();
        store.append_message(&id, Role::User, "q").unwrap();
        store.append_message(&id, Role::Assistant, "a").unwrap();

        store.clear_history(&id).unwrap();
        let session = store.get_session(&id).unwrap();
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].content, "sys");
    }

    #[test]
    fn test_reads_are_snapshots() {
        let store = ConversationStore::in_memory();
        let id = store.create_session(None, None).unwrap();

        let mut snapshot = store.get_session(&id).unwrap();
        snapshot.messages.push(Message::new(Role::User, "not stored"));
        assert!(store.get_session(&id).unwrap().messages.is_empty());
    }

    #[test]
    fn test_list_sessions_most_recent_first() {
        let store = ConversationStore::in_memory();
        let a = store.create_session(Some("a".into()), None).unwrap();
        let b = store.create_session(Some("b".into()), None).unwrap();
        store.append_message(&a, Role::User, "latest question").unwrap();

        let list = store.list_sessions();
        assert_eq!(list[0].id, a);
        assert_eq!(list[0].preview.as_deref(), Some("latest question"));
        assert_eq!(list[0].message_count, 1);
        assert!(!list[0].is_active);
        assert_eq!(list[1].id, b);
        assert!(list[1].is_active);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");

        let (sessions, active) = {
            let store = ConversationStore::open(&path).unwrap();
            let a = store.create_session(Some("a".into()), Some("sys".into())).unwrap();
            store.append_message(&a, Role::User, "hello").unwrap();
            store.append_message(&a, Role::Assistant, "world").unwrap();
            let b = store.create_session(Some("b".into()), None).unwrap();
            store.update_session(
                &b,
                SessionUpdate {
                    title: Some("bee".into()),
                    ..Default::default()
                },
            )
            .unwrap();
            store.set_active_session(&a).unwrap();

            let sessions: HashMap<String, Session> = [&a, &b]
                .iter()
                .map(|id| ((*id).clone(), store.get_session(id).unwrap()))
                .collect();
            (sessions, store.active_session_id())
        };

        let reopened = ConversationStore::open(&path).unwrap();
        assert_eq!(reopened.active_session_id(), active);
        assert_eq!(reopened.len(), sessions.len());
        for (id, session) in &sessions {
            assert_eq!(&reopened.get_session(id).unwrap(), session);
        }
    }

    #[test]
    fn test_deleted_session_stays_deleted_after_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let kept = {
            let store = ConversationStore::open(&path).unwrap();
            let kept = store.create_session(Some("keep".into()), None).unwrap();
            let gone = store.create_session(Some("gone".into()), None).unwrap();
            store.delete_session(&gone).unwrap();
            kept
        };

        let reopened = ConversationStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.active_session_id(), Some(kept));
    }

    #[tokio::test]
    async fn test_session_lock_is_shared_per_session() {
        let store = ConversationStore::in_memory();
        let a1 = store.session_lock("a");
        let a2 = store.session_lock("a");
        let b = store.session_lock("b");
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));

        let _guard = a1.lock().await;
        assert!(a2.try_lock().is_err());
        assert!(b.try_lock().is_ok());
    }
}
