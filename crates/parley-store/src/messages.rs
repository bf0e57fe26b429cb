use parley_shared::{Message, MessageStatus};
use rusqlite::{params, Connection, OptionalExtension};

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Insert `message` into a conversation log unless its id is already
    /// present, then evict the oldest entries beyond `cap`.
    ///
    /// Returns `false` for a duplicate, whose stored copy is left untouched,
    /// and for a message too old to survive the eviction.
    pub fn insert_message(&self, conversation_id: &str, message: &Message, cap: usize) -> Result<bool> {
        if !insert_if_absent(self.conn(), conversation_id, message)? {
            return Ok(false);
        }
        truncate(self.conn(), conversation_id, cap)?;
        contains(self.conn(), conversation_id, &message.id)
    }

    /// Same contract as [`Database::insert_message`] for a batch, in one
    /// transaction with a single truncation. Returns the ids that were new
    /// and are still stored.
    pub fn insert_messages(
        &mut self,
        conversation_id: &str,
        messages: &[Message],
        cap: usize,
    ) -> Result<Vec<String>> {
        let tx = self.conn_mut().transaction()?;
        let mut inserted = Vec::new();
        for message in messages {
            if insert_if_absent(&tx, conversation_id, message)? {
                inserted.push(message.id.clone());
            }
        }
        if !inserted.is_empty() {
            truncate(&tx, conversation_id, cap)?;
            let mut kept = Vec::with_capacity(inserted.len());
            for id in inserted {
                if contains(&tx, conversation_id, &id)? {
                    kept.push(id);
                }
            }
            inserted = kept;
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Overwrite the status of a stored message. Returns `false` if the id
    /// is not in the conversation.
    pub fn set_message_status(
        &self,
        conversation_id: &str,
        id: &str,
        status: MessageStatus,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET status = ?3 WHERE conversation_id = ?1 AND id = ?2",
            params![conversation_id, id, status.as_str()],
        )?;
        Ok(affected > 0)
    }

    /// Full conversation log in `(savedAt ?? timestamp, id)` order.
    pub fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(
            "SELECT payload, status FROM messages
             WHERE conversation_id = ?1
             ORDER BY sort_ts ASC, id ASC",
        )?;

        let rows = stmt.query_map(params![conversation_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (payload, status) = row?;
            messages.push(decode_row(&payload, &status)?);
        }
        Ok(messages)
    }

    pub fn get_message(&self, conversation_id: &str, id: &str) -> Result<Option<Message>> {
        let row = self
            .conn()
            .query_row(
                "SELECT payload, status FROM messages WHERE conversation_id = ?1 AND id = ?2",
                params![conversation_id, id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        row.map(|(payload, status)| decode_row(&payload, &status))
            .transpose()
    }

    pub fn count_messages(&self, conversation_id: &str) -> Result<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn delete_conversation(&self, conversation_id: &str) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        Ok(affected)
    }
}

fn insert_if_absent(conn: &Connection, conversation_id: &str, message: &Message) -> Result<bool> {
    let (sort_ts, _) = message.sort_key();
    let affected = conn.execute(
        "INSERT OR IGNORE INTO messages (conversation_id, id, sort_ts, status, payload)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            conversation_id,
            message.id,
            sort_ts,
            message.status.as_str(),
            serde_json::to_string(message)?,
        ],
    )?;
    Ok(affected > 0)
}

// Keeps the `cap` most recent entries by (sort_ts, id).
fn truncate(conn: &Connection, conversation_id: &str, cap: usize) -> Result<()> {
    let evicted = conn.execute(
        "DELETE FROM messages WHERE rowid IN (
             SELECT rowid FROM messages
             WHERE conversation_id = ?1
             ORDER BY sort_ts DESC, id DESC
             LIMIT -1 OFFSET ?2
         )",
        params![conversation_id, cap as i64],
    )?;
    if evicted > 0 {
        tracing::debug!(conversation = %conversation_id, evicted, "retention cap reached");
    }
    Ok(())
}

fn contains(conn: &Connection, conversation_id: &str, id: &str) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM messages WHERE conversation_id = ?1 AND id = ?2",
            params![conversation_id, id],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

// The status column is authoritative; the payload keeps the first write.
fn decode_row(payload: &str, status: &str) -> Result<Message> {
    let mut message: Message = serde_json::from_str(payload)?;
    if let Ok(status) = status.parse() {
        message.status = status;
    }
    Ok(message)
}
