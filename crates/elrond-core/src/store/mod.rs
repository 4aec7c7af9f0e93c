//! Durable state for rings, installation groups, releases, and webhooks.
//!
//! The store wraps a single SQLite connection behind a mutex. Row-level
//! locks are advisory and implemented as conditional UPDATEs (set the
//! lock columns only where the row is currently unlocked), which makes
//! them safe across multiple server instances sharing one database.
//! Multi-row mutations run inside SQLite transactions.

mod error;
mod installation_group;
mod lock;
mod migrations;
mod release;
mod ring;
mod webhook;

pub use error::StoreError;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;

/// SQLite-backed store shared by the control plane and the supervisors.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Opens (creating if necessary) the database at `path` and brings
    /// the schema up to the latest version.
    ///
    /// # Errors
    ///
    /// Returns an error when the database cannot be opened or a
    /// migration step fails.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        // journal_mode returns the resulting mode as a row.
        let _mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Opens the database at `path` without touching its schema. Used
    /// by tooling that inspects or migrates the schema explicitly.
    ///
    /// # Errors
    ///
    /// Returns an error when the database cannot be opened.
    pub fn open_existing(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens a fresh in-memory database with the full schema applied.
    ///
    /// # Errors
    ///
    /// Returns an error when a migration step fails.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}
