//! Request surface of the relay service.
//!
//! The client talks to the relay through this trait so that the
//! WebSocket client and the in-process loopback used in tests are
//! interchangeable.

use async_trait::async_trait;
use parley_shared::protocol::{
    DeliveryStatus, ReceiptKind, RegisteredUser, RelayedMessage, ServerFrame, SignalPayload,
    UserInfo, UserSummary, UsernameResult,
};
use parley_shared::Address;

use crate::error::NetError;
use crate::subscribers::Subscription;

/// A peer's encryption key as last seen by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyInfo {
    pub public_key: String,
    pub online: bool,
}

#[async_trait]
pub trait RelayApi: Send + Sync {
    /// Whether requests can currently reach the relay.
    fn is_connected(&self) -> bool;

    async fn register(
        &self,
        address: &Address,
        public_key: &str,
        username: Option<&str>,
    ) -> Result<RegisteredUser, NetError>;

    async fn set_username(&self, username: &str) -> Result<UsernameResult, NetError>;

    async fn lookup_by_username(&self, username: &str) -> Result<Option<UserSummary>, NetError>;

    /// `Ok(None)` when the relay has never seen `address`.
    async fn get_public_key(&self, address: &Address) -> Result<Option<PublicKeyInfo>, NetError>;

    async fn get_user(&self, address: &Address) -> Result<Option<UserInfo>, NetError>;

    async fn check_online(&self, address: &Address) -> Result<bool, NetError>;

    /// Hand a ciphertext message to the relay. Resolves once the relay has
    /// accepted it.
    async fn send_message(&self, message: RelayedMessage) -> Result<DeliveryStatus, NetError>;

    async fn send_receipt(
        &self,
        message_id: &str,
        to: &Address,
        kind: ReceiptKind,
    ) -> Result<(), NetError>;

    async fn send_signal(&self, to: &Address, signal: SignalPayload) -> Result<(), NetError>;

    async fn get_history(&self, peer: &Address) -> Result<Vec<RelayedMessage>, NetError>;

    /// Inbound messages, copies of our own sends and receipts. Frames
    /// queue until read, so none is lost to a slow consumer.
    fn subscribe_deliveries(&self) -> Subscription<ServerFrame>;

    /// Every other unrequested frame: signals, presence changes and errors.
    /// A subscriber that falls behind misses frames.
    fn subscribe(&self) -> Subscription<ServerFrame>;
}
