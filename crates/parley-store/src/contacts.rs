use parley_shared::Contact;
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;

impl Database {
    pub fn upsert_contact(&self, contact: &Contact) -> Result<()> {
        self.conn().execute(
            "INSERT INTO contacts (address, last_message_time, payload)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(address) DO UPDATE SET
                 last_message_time = excluded.last_message_time,
                 payload = excluded.payload",
            params![
                contact.address.to_lowercase(),
                contact.last_message_time,
                serde_json::to_string(contact)?,
            ],
        )?;
        Ok(())
    }

    /// Contacts ordered by most recent activity.
    pub fn get_contacts(&self) -> Result<Vec<Contact>> {
        let mut stmt = self.conn().prepare(
            "SELECT payload FROM contacts ORDER BY last_message_time DESC, address ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(serde_json::from_str(&row?)?);
        }
        Ok(contacts)
    }

    pub fn get_contact(&self, address: &str) -> Result<Option<Contact>> {
        let payload: Option<String> = self
            .conn()
            .query_row(
                "SELECT payload FROM contacts WHERE address = ?1",
                params![address.to_lowercase()],
                |row| row.get(0),
            )
            .optional()?;

        Ok(payload.map(|p| serde_json::from_str(&p)).transpose()?)
    }
}
