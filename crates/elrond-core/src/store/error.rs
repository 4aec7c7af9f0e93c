//! Store error type.

use thiserror::Error;

/// Errors returned by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The connection mutex was poisoned by a panicking thread.
    #[error("connection lock poisoned")]
    Poisoned,

    /// An entity referenced by a batch operation does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// A migration step could not be applied.
    #[error("migration failed: {0}")]
    Migration(String),

    /// The schema version on disk is incompatible with this server.
    #[error("server requires at least schema {required}, current is {current}")]
    SchemaMismatch {
        current: semver::Version,
        required: semver::Version,
    },
}

impl StoreError {
    /// Returns whether this error was caused by a unique-index or
    /// primary-key violation, so callers can surface a user-facing
    /// conflict instead of an internal error.
    #[must_use]
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            StoreError::Database(rusqlite::Error::SqliteFailure(err, _))
                if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        )
    }
}
