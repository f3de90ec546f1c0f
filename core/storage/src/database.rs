//! SQLite database holding note records, the sync queue and vault metadata.
//!
//! A single connection sits behind a mutex. Callers that need a note mutation
//! and its queue entry to land together go through [`Database::transaction`].

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use notevault_common::{Error, Result};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS notes (
        id TEXT PRIMARY KEY,
        content TEXT NOT NULL,
        tags TEXT NOT NULL DEFAULT '[]',
        color TEXT,
        pinned INTEGER NOT NULL DEFAULT 0,
        archived INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        synced INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS sync_queue (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        op_type TEXT NOT NULL,
        note_id TEXT NOT NULL,
        payload TEXT,
        timestamp INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_sync_queue_order ON sync_queue(timestamp, seq);
    CREATE INDEX IF NOT EXISTS idx_sync_queue_note ON sync_queue(note_id);

    CREATE TABLE IF NOT EXISTS vault_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
"#;

/// Map a SQLite error into the crate error type.
pub(crate) fn db_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

/// Local vault database.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Create or open a database file.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        let db = Self::init(conn)?;
        info!(path = %path.display(), "Vault database opened");
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("database lock poisoned".to_string()))
    }

    /// Run `f` with the connection held.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` inside a transaction. Commits if `f` returns `Ok`, rolls back
    /// otherwise.
    pub fn transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let value = f(&tx)?;
        tx.commit().map_err(db_err)?;
        Ok(value)
    }

    /// Get a vault metadata value.
    pub fn meta(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| read_meta(conn, key))
    }

    /// Set a vault metadata value.
    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| write_meta(conn, key, value))
    }
}

/// Read a metadata value on an open connection or transaction.
pub fn read_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM vault_meta WHERE key = ?1",
        [key],
        |row| row.get(0),
    )
    .optional()
    .map_err(db_err)
}

/// Write a metadata value on an open connection or transaction.
pub fn write_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    debug!(key, "Writing vault metadata");
    conn.execute(
        "INSERT OR REPLACE INTO vault_meta (key, value) VALUES (?1, ?2)",
        params![key, value],
    )
    .map_err(db_err)?;
    Ok(())
}

/// Remove a metadata value. Removing a missing key is a no-op.
pub fn delete_meta(conn: &Connection, key: &str) -> Result<()> {
    conn.execute("DELETE FROM vault_meta WHERE key = ?1", [key])
        .map_err(db_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_metadata() {
        let db = Database::in_memory().unwrap();

        assert!(db.meta("snapshot").unwrap().is_none());
        db.set_meta("snapshot", "{}").unwrap();
        assert_eq!(db.meta("snapshot").unwrap().as_deref(), Some("{}"));

        db.set_meta("snapshot", "[]").unwrap();
        assert_eq!(db.meta("snapshot").unwrap().as_deref(), Some("[]"));
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = Database::in_memory().unwrap();

        let result: Result<()> = db.transaction(|tx| {
            write_meta(tx, "flag", "1")?;
            Err(Error::InvalidInput("abort".to_string()))
        });
        assert!(result.is_err());
        assert!(db.meta("flag").unwrap().is_none());
    }

    #[test]
    fn test_delete_meta() {
        let db = Database::in_memory().unwrap();
        db.set_meta("flag", "1").unwrap();
        db.with_conn(|conn| delete_meta(conn, "flag")).unwrap();
        db.with_conn(|conn| delete_meta(conn, "flag")).unwrap();
        assert!(db.meta("flag").unwrap().is_none());
    }

    #[test]
    fn test_reopen_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("vault.db");

        {
            let db = Database::open(&path).unwrap();
            db.set_meta("snapshot", "payload").unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(db.meta("snapshot").unwrap().as_deref(), Some("payload"));
    }
}
