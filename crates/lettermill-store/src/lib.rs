//! # Lettermill Store
//!
//! Store implementations behind the collaborator traits in `lettermill-core`:
//!
//! - [`MailDb`] — SQLite persistence (rusqlite, migrate-on-open, RFC3339
//!   timestamps). One handle implements every store trait plus the lock
//!   store, so the CLI wires a single database for everything.
//! - [`MemoryStore`] / [`MemoryLockStore`] / [`RecordingDispatcher`] —
//!   clonable `Arc<Mutex<…>>`-backed implementations for tests and embedders
//!   that don't want a database on disk.

pub mod db;
pub mod memory;
mod sqlite;

pub use db::MailDb;
pub use memory::{MemoryLockStore, MemoryStore, RecordingDispatcher, SentEmail};
