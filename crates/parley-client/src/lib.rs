//! # parley-client
//!
//! Client side of Parley message delivery.
//!
//! The [`DeliveryCoordinator`] decides how each message leaves the device
//! (direct peer link, relay, or the local outbox), decrypts and deduplicates
//! what arrives, and keeps the local store and contact list in step. It is
//! driven by:
//!
//! - [`RelayClient`], a [`RelayApi`](parley_net::RelayApi) over a WebSocket
//!   or any other request/response pipe,
//! - [`RelaySignalChannel`], which carries signal payloads through the relay,
//! - [`EventHub`], the per-category event streams a UI subscribes to.

pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod relay_client;
pub mod relay_signal;
pub mod state;
pub mod typing;

pub use config::ClientConfig;
pub use coordinator::{
    DeliveryCoordinator, FlushSummary, QueueReason, ResumeSummary, SendOutcome, Transports,
};
pub use error::ClientError;
pub use events::{EventHub, MessageEvent, ReceiptEvent, SendProgress, TypingEvent};
pub use relay_client::RelayClient;
pub use relay_signal::RelaySignalChannel;
pub use state::{ContactBook, OpenConversation, ViewState};
pub use typing::TypingTracker;
