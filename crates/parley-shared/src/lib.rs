//! Types, cryptography and wire protocol shared by the Parley client and
//! relay server.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod types;

pub use error::{CryptoError, IdentityError, ProtocolError};
pub use identity::Identity;
pub use types::{Address, Contact, Message, MessageStatus, OutboxEntry, ReplyTo, Transport};
