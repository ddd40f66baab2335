//! # hearth-store
//!
//! Durable storage for the Hearth messaging core, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides typed CRUD helpers for users,
//! conversations, participants, messages, read receipts and reactions.
//! Async callers are expected to run these helpers on a blocking thread.

pub mod conversations;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod participants;
pub mod reactions;
pub mod receipts;
pub mod users;

mod error;
mod rows;

pub use database::Database;
pub use error::{Result, StoreError};
