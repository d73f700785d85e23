//! SQLite persistence for sessions and the active-session pointer.
//!
//! Uses `rusqlite` in synchronous mode; the store calls it while holding its
//! own lock, so there is exactly one writer. WAL mode is enabled for file
//! databases.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use super::errors::SessionError;
use super::types::{Message, Session};
use crate::inference::types::Role;

const ACTIVE_SESSION_KEY: &str = "active_session_id";

// ─── Database ────────────────────────────────────────────────────────────────

/// SQLite database handle for conversation state.
pub struct SessionDatabase {
    conn: Connection,
}

/// One batch of changes written in a single transaction.
#[derive(Debug, Default)]
pub struct ChangeSet<'a> {
    pub upserted: Vec<&'a Session>,
    pub deleted: Vec<&'a str>,
    /// The active pointer after the change.
    pub active: Option<&'a str>,
}

impl SessionDatabase {
    /// Open (or create) the session database at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: &str) -> Result<Self, SessionError> {
        let conn = Connection::open(path)?;

        if path != ":memory:" {
            // journal_mode returns a row, so it can't go through execute().
            conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        }
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self { conn };
        db.create_tables()?;
        Ok(db)
    }

    /// Create all required tables if they don't exist.
    fn create_tables(&self) -> Result<(), SessionError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                system_message TEXT,
                metadata TEXT NOT NULL DEFAULT '{}'
            );

            CREATE TABLE IF NOT EXISTS session_messages (
                session_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                PRIMARY KEY (session_id, position),
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS app_state (
                key TEXT PRIMARY KEY,
                value TEXT
            );
            ",
        )?;
        Ok(())
    }

    // ─── Writes ─────────────────────────────────────────────────────────

    /// Apply a change set atomically.
    pub fn write_changes(&mut self, changes: &ChangeSet<'_>) -> Result<(), SessionError> {
        let tx = self.conn.transaction()?;
        for session in &changes.upserted {
            write_session(&tx, session)?;
        }
        for id in &changes.deleted {
            tx.execute("DELETE FROM session_messages WHERE session_id = ?1", params![id])?;
            tx.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        }
        tx.execute(
            "INSERT INTO app_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![ACTIVE_SESSION_KEY, changes.active],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ─── Reads ──────────────────────────────────────────────────────────

    /// Load every session, ordered by creation time.
    pub fn load_sessions(&self) -> Result<Vec<Session>, SessionError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, created_at, updated_at, system_message, metadata
             FROM sessions
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SessionRow {
                id: row.get(0)?,
                title: row.get(1)?,
                created_at: row.get(2)?,
                updated_at: row.get(3)?,
                system_message: row.get(4)?,
                metadata: row.get(5)?,
            })
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            let row = row?;
            let messages = self.load_messages(&row.id)?;
            sessions.push(row.into_session(messages)?);
        }
        Ok(sessions)
    }

    /// Messages of one session in their stored order.
    pub fn load_messages(&self, session_id: &str) -> Result<Vec<Message>, SessionError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, role, content, timestamp
             FROM session_messages
             WHERE session_id = ?1
             ORDER BY position ASC",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (id, role, content, timestamp) = row?;
            messages.push(Message {
                id,
                role: role
                    .parse::<Role>()
                    .map_err(|reason| SessionError::Serialization { reason })?,
                content,
                timestamp: parse_timestamp(&timestamp)?,
            });
        }
        Ok(messages)
    }

    /// The persisted active-session pointer.
    pub fn active_session_id(&self) -> Result<Option<String>, SessionError> {
        let value: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT value FROM app_state WHERE key = ?1",
                params![ACTIVE_SESSION_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.flatten())
    }
}

// ─── Row helpers ─────────────────────────────────────────────────────────────

struct SessionRow {
    id: String,
    title: String,
    created_at: String,
    updated_at: String,
    system_message: Option<String>,
    metadata: String,
}

impl SessionRow {
    fn into_session(self, messages: Vec<Message>) -> Result<Session, SessionError> {
        let metadata: BTreeMap<String, serde_json::Value> = serde_json::from_str(&self.metadata)?;
        Ok(Session {
            id: self.id,
            title: self.title,
            messages,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            system_message: self.system_message,
            metadata,
        })
    }
}

fn write_session(tx: &Transaction<'_>, session: &Session) -> Result<(), SessionError> {
    let metadata = serde_json::to_string(&session.metadata)?;
    tx.execute(
        "INSERT INTO sessions (id, title, created_at, updated_at, system_message, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            updated_at = excluded.updated_at,
            system_message = excluded.system_message,
            metadata = excluded.metadata",
        params![
            session.id,
            session.title,
            format_timestamp(&session.created_at),
            format_timestamp(&session.updated_at),
            session.system_message,
            metadata,
        ],
    )?;

    tx.execute(
        "DELETE FROM session_messages WHERE session_id = ?1",
        params![session.id],
    )?;
    let mut insert = tx.prepare(
        "INSERT INTO session_messages (session_id, position, id, role, content, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for (position, message) in session.messages.iter().enumerate() {
        insert.execute(params![
            session.id,
            position as i64,
            message.id,
            message.role.as_str(),
            message.content,
            format_timestamp(&message.timestamp),
        ])?;
    }
    Ok(())
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, SessionError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| SessionError::Serialization {
            reason: format!("invalid timestamp '{raw}': {e}"),
        })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> SessionDatabase {
        SessionDatabase::open(":memory:").unwrap()
    }

    fn session_with_turns() -> Session {
        let mut s = Session::new(Some("Parser work".into()), Some("Be terse.".into()));
        s.messages.push(Message::new(Role::User, "write a lexer"));
        s.messages.push(Message::new(Role::Assistant, "```rust\nfn lex() {}\n```"));
        s.metadata.insert("language".into(), serde_json::json!("rust"));
        s
    }

    #[test]
    fn test_write_and_load_session() {
        let mut db = test_db();
        let s = session_with_turns();
        db.write_changes(&ChangeSet {
            upserted: vec![&s],
            deleted: vec![],
            active: Some(&s.id),
        })
        .unwrap();

        let loaded = db.load_sessions().unwrap();
        assert_eq!(loaded, vec![s.clone()]);
        assert_eq!(db.active_session_id().unwrap().as_deref(), Some(s.id.as_str()));
    }

    #[test]
    fn test_rewrite_replaces_messages() {
        let mut db = test_db();
        let mut s = session_with_turns();
        db.write_changes(&ChangeSet {
            upserted: vec![&s],
            ..Default::default()
        })
        .unwrap();

        s.clear_history();
        db.write_changes(&ChangeSet {
            upserted: vec![&s],
            ..Default::default()
        })
        .unwrap();

        let messages = db.load_messages(&s.id).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::System);
    }

    #[test]
    fn test_delete_session_and_clear_active() {
        let mut db = test_db();
        let s = session_with_turns();
        db.write_changes(&ChangeSet {
            upserted: vec![&s],
            deleted: vec![],
            active: Some(&s.id),
        })
        .unwrap();
        db.write_changes(&ChangeSet {
            upserted: vec![],
            deleted: vec![&s.id],
            active: None,
        })
        .unwrap();

        assert!(db.load_sessions().unwrap().is_empty());
        assert!(db.load_messages(&s.id).unwrap().is_empty());
        assert_eq!(db.active_session_id().unwrap(), None);
    }

    #[test]
    fn test_empty_database_has_no_active_session() {
        let db = test_db();
        assert_eq!(db.active_session_id().unwrap(), None);
        assert!(db.load_sessions().unwrap().is_empty());
    }
}
