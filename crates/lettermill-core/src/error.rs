//! Lettermill error type — one enum for the whole workspace.

use thiserror::Error;

/// Convenience alias used across all Lettermill crates.
pub type Result<T> = std::result::Result<T, LettermillError>;

/// Errors surfaced by the automation engine and its collaborators.
#[derive(Debug, Error)]
pub enum LettermillError {
    /// Bad or missing configuration (missing template, unknown automation).
    /// Fatal for the automation/contact pair it concerns, never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Store-level failure (SQLite, row mapping).
    #[error("Store error: {0}")]
    Store(String),

    /// Outbound email failure — recoverable; deferred tasks stay pending
    /// and are retried on a later tick.
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// Template rendering failure.
    #[error("Render error: {0}")]
    Render(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
