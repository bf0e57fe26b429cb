//! v001 -- Initial schema creation.
//!
//! Creates the four tables: `messages`, `outbox`, `contacts` and
//! `key_material`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Conversation logs
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    conversation_id TEXT NOT NULL,             -- lowercase peer address or group id
    id              TEXT NOT NULL,             -- client-generated message id
    sort_ts         INTEGER NOT NULL,          -- savedAt ?? timestamp (ms)
    status          TEXT NOT NULL,             -- pending | sent | delivered | read
    payload         TEXT NOT NULL,             -- JSON-encoded message

    PRIMARY KEY (conversation_id, id)
);

CREATE INDEX IF NOT EXISTS idx_messages_order
    ON messages(conversation_id, sort_ts, id);

-- ----------------------------------------------------------------
-- Outbox (messages not yet confirmed sent)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS outbox (
    id         TEXT NOT NULL,
    recipient  TEXT NOT NULL,                  -- lowercase address
    queued_at  INTEGER NOT NULL,
    payload    TEXT NOT NULL,                  -- JSON-encoded outbox entry

    PRIMARY KEY (id, recipient)                -- group fan-out shares one id
);

CREATE INDEX IF NOT EXISTS idx_outbox_recipient ON outbox(recipient, queued_at);

-- ----------------------------------------------------------------
-- Contacts and groups
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS contacts (
    address           TEXT PRIMARY KEY NOT NULL,
    last_message_time INTEGER NOT NULL,
    payload           TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Key material, keyed by owning address
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS key_material (
    address    TEXT PRIMARY KEY NOT NULL,
    seed_hex   TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
