use parley_shared::OutboxEntry;
use rusqlite::params;

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Queue an entry. Re-queuing an id for the same recipient replaces the
    /// stored entry, so a message that was queued before encryption can
    /// later carry its ciphertext.
    pub fn insert_outbox(&self, entry: &OutboxEntry) -> Result<()> {
        self.conn().execute(
            "INSERT INTO outbox (id, recipient, queued_at, payload)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id, recipient) DO UPDATE SET payload = excluded.payload",
            params![
                entry.message.id,
                entry.message.to.to_lowercase(),
                entry.queued_at,
                serde_json::to_string(entry)?,
            ],
        )?;
        Ok(())
    }

    /// All pending entries, oldest first.
    pub fn get_outbox(&self) -> Result<Vec<OutboxEntry>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT payload FROM outbox ORDER BY queued_at ASC, id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(serde_json::from_str(&row?)?);
        }
        Ok(entries)
    }

    pub fn get_outbox_for(&self, recipient: &str) -> Result<Vec<OutboxEntry>> {
        let mut stmt = self.conn().prepare(
            "SELECT payload FROM outbox WHERE recipient = ?1 ORDER BY queued_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![recipient.to_lowercase()], |row| {
            row.get::<_, String>(0)
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(serde_json::from_str(&row?)?);
        }
        Ok(entries)
    }

    pub fn delete_outbox(&self, id: &str, recipient: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM outbox WHERE id = ?1 AND recipient = ?2",
            params![id, recipient.to_lowercase()],
        )?;
        Ok(affected > 0)
    }
}
