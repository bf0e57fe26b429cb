//! # parley-store
//!
//! Local storage for a Parley device, backed by SQLite.
//!
//! [`Database`] is the synchronous handle with typed helpers per table.
//! [`LocalStore`] wraps it for async callers and serializes every
//! read-modify-write on the same conversation (or on the outbox) so that
//! inbound messages and outbox flushes never lose each other's updates.

pub mod contacts;
pub mod database;
pub mod keys;
pub mod local_store;
pub mod locks;
pub mod messages;
pub mod migrations;
pub mod outbox;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use local_store::LocalStore;
pub use locks::KeyedLocks;
