//! Async facade over [`Database`].
//!
//! Every mutation of a conversation log takes that conversation's keyed lock
//! first, and every outbox mutation takes the outbox lock, so an inbound
//! message and an outbox flush touching the same conversation are applied
//! one after the other. The SQLite connection itself sits behind a plain
//! mutex that is never held across an `.await`.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use parley_shared::constants::LOCAL_HISTORY_CAP;
use parley_shared::{Contact, Message, MessageStatus, OutboxEntry};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::locks::KeyedLocks;

const OUTBOX_LOCK: &str = "outbox";

#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    locks: KeyedLocks,
    cap: usize,
}

impl LocalStore {
    pub fn new(db: Database) -> Self {
        Self::with_cap(db, LOCAL_HISTORY_CAP)
    }

    /// Store with a custom per-conversation retention cap.
    pub fn with_cap(db: Database, cap: usize) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            locks: KeyedLocks::new(),
            cap,
        }
    }

    /// Store in the platform data directory.
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(Database::new(None)?))
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Database::open_at(path, None)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    fn db(&self) -> Result<MutexGuard<'_, Database>> {
        self.db.lock().map_err(|_| StoreError::Poisoned)
    }

    // -- conversation logs ---------------------------------------------------

    /// Append a message unless its id is already in the conversation.
    /// Returns `true` when the message was new and is still stored after
    /// the retention cap is applied.
    pub async fn append_message(&self, conversation_id: &str, message: &Message) -> Result<bool> {
        let conversation_id = conversation_id.to_lowercase();
        let _guard = self.locks.lock(&conversation_key(&conversation_id)).await;

        let inserted = self.db()?.insert_message(&conversation_id, message, self.cap)?;
        if inserted {
            tracing::debug!(conversation = %conversation_id, id = %message.id, "message stored");
        } else {
            tracing::trace!(conversation = %conversation_id, id = %message.id, "duplicate or evicted, ignored");
        }
        Ok(inserted)
    }

    /// Append many messages in one transaction. Returns the ids that were new
    /// and kept.
    pub async fn append_messages_bulk(
        &self,
        conversation_id: &str,
        messages: &[Message],
    ) -> Result<Vec<String>> {
        let conversation_id = conversation_id.to_lowercase();
        let _guard = self.locks.lock(&conversation_key(&conversation_id)).await;

        let inserted = self
            .db()?
            .insert_messages(&conversation_id, messages, self.cap)?;
        tracing::debug!(
            conversation = %conversation_id,
            offered = messages.len(),
            inserted = inserted.len(),
            "bulk merge"
        );
        Ok(inserted)
    }

    pub async fn update_status(
        &self,
        conversation_id: &str,
        id: &str,
        status: MessageStatus,
    ) -> Result<bool> {
        let conversation_id = conversation_id.to_lowercase();
        let _guard = self.locks.lock(&conversation_key(&conversation_id)).await;

        self.db()?.set_message_status(&conversation_id, id, status)
    }

    pub async fn read_history(&self, conversation_id: &str) -> Result<Vec<Message>> {
        self.db()?.get_messages(&conversation_id.to_lowercase())
    }

    pub async fn clear_history(&self, conversation_id: &str) -> Result<()> {
        let conversation_id = conversation_id.to_lowercase();
        let _guard = self.locks.lock(&conversation_key(&conversation_id)).await;

        let removed = self.db()?.delete_conversation(&conversation_id)?;
        tracing::info!(conversation = %conversation_id, removed, "history cleared");
        Ok(())
    }

    /// Wipe messages, outbox, contacts and key material together.
    pub async fn clear_all(&self) -> Result<()> {
        let _guard = self.locks.lock(OUTBOX_LOCK).await;
        self.db()?.wipe()
    }

    // -- outbox --------------------------------------------------------------

    pub async fn enqueue(&self, entry: &OutboxEntry) -> Result<()> {
        let _guard = self.locks.lock(OUTBOX_LOCK).await;
        self.db()?.insert_outbox(entry)?;
        tracing::debug!(id = %entry.message.id, to = %entry.message.to, "queued in outbox");
        Ok(())
    }

    pub async fn list_pending(&self) -> Result<Vec<OutboxEntry>> {
        self.db()?.get_outbox()
    }

    pub async fn list_pending_for(&self, address: &str) -> Result<Vec<OutboxEntry>> {
        self.db()?.get_outbox_for(address)
    }

    /// Remove an entry after a confirmed send.
    pub async fn dequeue(&self, id: &str, recipient: &str) -> Result<bool> {
        let _guard = self.locks.lock(OUTBOX_LOCK).await;
        self.db()?.delete_outbox(id, recipient)
    }

    // -- contacts ------------------------------------------------------------

    pub async fn upsert_contact(&self, contact: &Contact) -> Result<()> {
        self.db()?.upsert_contact(contact)
    }

    pub async fn list_contacts(&self) -> Result<Vec<Contact>> {
        self.db()?.get_contacts()
    }

    pub async fn get_contact(&self, address: &str) -> Result<Option<Contact>> {
        self.db()?.get_contact(address)
    }

    // -- key material --------------------------------------------------------

    pub async fn save_key_material(&self, address: &str, seed: &[u8; 32]) -> Result<()> {
        self.db()?.store_key_material(address, seed)
    }

    pub async fn load_key_material(&self, address: &str) -> Result<Option<[u8; 32]>> {
        self.db()?.load_key_material(address)
    }
}

fn conversation_key(conversation_id: &str) -> String {
    format!("conversation:{conversation_id}")
}
