//! presence-store — SQLite persistence for identities and attendance.
//!
//! A single connection is shared between [`SqliteEmbeddingStore`] and
//! [`SqliteLedger`]. Every write runs in one `IMMEDIATE` transaction, so a
//! failed call leaves no partial row behind.
//!
//! # Schema
//!
//! `identities(id, name, email UNIQUE, embedding BLOB, registered_at_ms)`;
//! embeddings are packed little-endian `f32`.
//!
//! `attendance(id, identity_id → identities.id, timestamp_ms)`, indexed on
//! `(identity_id, timestamp_ms)` for the dedup window lookup.

pub mod attendance;
pub mod identities;

pub use attendance::SqliteLedger;
pub use identities::SqliteEmbeddingStore;

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OpenError {
    #[error("cannot create database directory {path}: {source}")]
    CreateDir {
        path: String,
        source: std::io::Error,
    },
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Handle to an opened, schema-initialized database.
#[derive(Debug, Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (creating if needed) the database file at `path`.
    pub fn open(path: &Path) -> Result<Self, OpenError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| OpenError::CreateDir {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init_schema(&conn)?;
        tracing::info!(path = %path.display(), journal_mode = %mode, "database opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, OpenError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Initializes the database schema.
    pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS identities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                email TEXT NOT NULL UNIQUE,
                embedding BLOB NOT NULL,
                registered_at_ms INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS attendance (
                id TEXT PRIMARY KEY,
                identity_id INTEGER NOT NULL REFERENCES identities(id),
                timestamp_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_attendance_identity_ts
                ON attendance(identity_id, timestamp_ms);",
        )
    }

    /// Identity store over this database, accepting `dim`-dimensional embeddings.
    pub fn embedding_store(&self, dim: usize) -> SqliteEmbeddingStore {
        SqliteEmbeddingStore::new(Arc::clone(&self.conn), dim)
    }

    pub fn ledger(&self, window: Duration) -> SqliteLedger {
        SqliteLedger::new(Arc::clone(&self.conn), window)
    }
}

pub(crate) fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, String> {
    conn.lock()
        .map_err(|_| "connection lock poisoned".to_string())
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, String> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| format!("timestamp out of range: {ms}"))
}
