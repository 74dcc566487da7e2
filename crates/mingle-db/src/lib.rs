pub mod migrations;
pub mod models;
pub mod queries;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::info;

use mingle_types::error::{ChatError, ChatResult};

/// Durable store for messages, groups and memberships.
///
/// A single connection behind a mutex: every mutation is one statement or a
/// short transaction, so contention stays scoped to the statement being run.
/// WAL mode keeps readers from blocking the writer.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> ChatResult<Self> {
        let conn = Connection::open(path).map_err(store_err)?;

        // WAL mode for concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(store_err)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(store_err)?;

        migrations::run(&conn)?;

        info!("Database opened at {}", path.display());
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// In-memory database, used by tests and ephemeral dev setups.
    pub fn open_in_memory() -> ChatResult<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(store_err)?;
        migrations::run(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn with_conn<F, T>(&self, f: F) -> ChatResult<T>
    where
        F: FnOnce(&Connection) -> ChatResult<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ChatError::Store(format!("db lock poisoned: {e}")))?;
        f(&conn)
    }
}

/// Map a backing-store failure into the taxonomy. Callers may retry only
/// idempotent operations on this variant.
pub(crate) fn store_err(e: rusqlite::Error) -> ChatError {
    ChatError::Store(e.to_string())
}
