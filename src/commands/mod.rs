//! Inbound commands.
//!
//! Transport-agnostic async functions over the shared [`crate::AppState`];
//! `server` binds them to HTTP routes.

pub mod chat;
pub mod session;
