//! Schema migrations, tracked with `PRAGMA user_version`.
//!
//! Each entry in [`MIGRATIONS`] moves the schema to its version and runs
//! inside a transaction together with the version bump.

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Up = fn(&Connection) -> rusqlite::Result<()>;

const MIGRATIONS: &[(u32, &str, Up)] = &[(1, "v001_initial", v001_initial::up)];

/// Schema version after all migrations ran.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |(version, _, _)| *version)
}

pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if current > latest_version() {
        return Err(StoreError::Migration(format!(
            "database schema v{current} is newer than this build (v{})",
            latest_version()
        )));
    }

    for (version, name, up) in MIGRATIONS.iter().filter(|(v, _, _)| *v > current) {
        tracing::info!(migration = name, version, "applying migration");
        let tx = conn.unchecked_transaction()?;
        up(&tx).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
    }
    Ok(())
}
