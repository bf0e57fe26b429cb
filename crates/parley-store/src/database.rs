//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees that
//! migrations are run before any other operation.
//!
//! With the `sqlcipher` feature the file is encrypted at rest using the key
//! passed to [`Database::open_at`]; the default `sqlite-plain` build ignores
//! the key (message bodies are already end-to-end ciphertext, but plaintext
//! copies of one's own messages are not).

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the default per-device database.
    ///
    /// The database file is placed in the platform-appropriate data directory:
    /// - Linux:   `~/.local/share/parley/parley.db`
    /// - macOS:   `~/Library/Application Support/com.parley.parley/parley.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\parley\parley\data\parley.db`
    pub fn new(db_key: Option<&[u8; 32]>) -> Result<Self> {
        let project_dirs =
            ProjectDirs::from("com", "parley", "parley").ok_or(StoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("parley.db");

        tracing::info!(path = %db_path.display(), "opening database");

        Self::open_at(&db_path, db_key)
    }

    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: &Path, db_key: Option<&[u8; 32]>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn, db_key)
    }

    /// Open a private in-memory database (tests, ephemeral sessions).
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, db_key: Option<&[u8; 32]>) -> Result<Self> {
        #[cfg(feature = "sqlcipher")]
        if let Some(key) = db_key {
            conn.pragma_update(None, "key", format!("x'{}'", hex::encode(key)))?;
        }
        #[cfg(not(feature = "sqlcipher"))]
        if db_key.is_some() {
            tracing::debug!("sqlcipher feature disabled, database key ignored");
        }

        // WAL is a no-op for in-memory databases.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run_migrations(&conn)?;

        Ok(Self { conn })
    }

    /// Return a reference to the underlying `rusqlite::Connection`.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Return a mutable reference to the underlying connection.
    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }

    /// Remove every message, contact, outbox entry and key in one
    /// transaction. Used for account deletion.
    pub fn wipe(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(
            "DELETE FROM messages;
             DELETE FROM outbox;
             DELETE FROM contacts;
             DELETE FROM key_material;",
        )?;
        tx.commit()?;
        tracing::warn!("local store wiped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let key = [0xABu8; 32];

        let db = Database::open_at(&path, Some(&key)).expect("should open");
        assert!(db.path().is_some());

        drop(db);
        // Reopening runs migrations again without failing.
        Database::open_at(&path, Some(&key)).expect("should reopen");
    }
}
