//! Error types for wxrelay-store.

use std::path::PathBuf;

/// Result type for wxrelay-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in wxrelay-store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error from SQLite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to create database directory.
    #[error("Failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The database was written by a newer schema than this build knows.
    #[error("Database schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: i32, supported: i32 },

    /// A thread panicked while holding the store lock.
    #[error("Store lock poisoned")]
    LockPoisoned,
}
