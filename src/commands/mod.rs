//! Inbound operations exposed to callers of the crate.
//!
//! Each command takes the shared [`AppState`](crate::AppState) and returns
//! `Result<_, String>` so it can sit directly behind an IPC boundary.

pub mod chat;
pub mod hardware;
pub mod session;
