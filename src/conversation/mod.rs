//! Conversation state: sessions with ordered messages plus the active pointer.
//!
//! [`ConversationStore`] is the only owner of session state; everything else
//! reads snapshots. Persistence goes through [`SessionDatabase`] (SQLite).

pub mod database;
pub mod errors;
pub mod store;
pub mod types;

pub use database::SessionDatabase;
pub use errors::SessionError;
pub use store::ConversationStore;
pub use types::{Message, Session, SessionListItem, SessionUpdate};
