//! Wire protocol.
//!
//! Three families of payloads:
//! - relay frames ([`ClientRequest`] / [`ServerResponse`]) exchanged with the
//!   relay over its WebSocket,
//! - signaling payloads ([`SignalPayload`]) carried by any signal channel,
//! - direct-channel envelopes ([`Envelope`]) exchanged peer to peer.
//!
//! Everything is JSON with a `type` (or `kind`) tag and camelCase fields.

use serde::{Deserialize, Serialize};

use crate::constants::MAX_FRAME_SIZE;
use crate::error::ProtocolError;
use crate::types::{Address, MessageStatus, ReplyTo};

// ---------------------------------------------------------------------------
// Encrypted content
// ---------------------------------------------------------------------------

/// Plaintext that goes inside the ciphertext. Quoted replies travel here so
/// the relay never sees quoted text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageContent {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyTo>,
}

impl MessageContent {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode opened plaintext. Bare UTF-8 from older peers becomes a plain
    /// text message.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        serde_json::from_slice(bytes).unwrap_or_else(|_| Self {
            text: String::from_utf8_lossy(bytes).into_owned(),
            reply_to: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Relay message
// ---------------------------------------------------------------------------

/// A ciphertext message as the relay sees it. `from` is stamped by the relay
/// from the sender's registration and never trusted from the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RelayedMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Address>,
    pub to: Address,
    pub encrypted: String,
    pub nonce: String,
    pub sender_public_key: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Recipient was connected and got the message immediately
    Delivered,
    /// Recipient offline; buffered until they register
    Stored,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptKind {
    Delivered,
    Read,
}

impl From<ReceiptKind> for MessageStatus {
    fn from(kind: ReceiptKind) -> Self {
        match kind {
            ReceiptKind::Delivered => MessageStatus::Delivered,
            ReceiptKind::Read => MessageStatus::Read,
        }
    }
}

// ---------------------------------------------------------------------------
// Client -> relay
// ---------------------------------------------------------------------------

/// A frame sent to the relay. `request_id` is echoed back on the reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(flatten)]
    pub frame: ClientFrame,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientFrame {
    Register(RegisterRequest),
    SetUsername(UsernameRequest),
    LookupByUsername(UsernameRequest),
    GetPublicKey(AddressRequest),
    SendMessage(RelayedMessage),
    MessageReceipt(ReceiptRequest),
    Signal(SignalRequest),
    GetHistory(HistoryRequest),
    CheckOnline(AddressRequest),
    GetUser(AddressRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub address: Address,
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsernameRequest {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressRequest {
    pub address: Address,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptRequest {
    pub message_id: String,
    /// Original sender of the message being acknowledged
    pub to: Address,
    pub receipt_type: ReceiptKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRequest {
    pub to: Address,
    pub signal: SignalPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRequest {
    pub peer_address: Address,
}

// ---------------------------------------------------------------------------
// Relay -> client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(flatten)]
    pub frame: ServerFrame,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerFrame {
    Registered(RegisteredUser),
    UsernameResult(UsernameResult),
    UserLookup(UserLookup),
    PublicKey(PublicKeyResponse),
    Message(RelayedMessage),
    MessageStatus(MessageStatusNotice),
    MessageSent(RelayedMessage),
    MessageReceipt(ReceiptNotice),
    Signal(SignalNotice),
    History(HistoryResponse),
    OnlineStatus(OnlineStatus),
    User(UserResponse),
    UserStatus(PresenceUpdate),
    Error(ErrorNotice),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredUser {
    pub address: Address,
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsernameResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub address: Address,
    pub username: String,
    pub public_key: String,
    pub online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserLookup {
    #[serde(default)]
    pub user: Option<UserSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyResponse {
    pub address: Address,
    #[serde(default)]
    pub public_key: Option<String>,
    pub online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageStatusNotice {
    pub id: String,
    pub status: DeliveryStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptNotice {
    pub message_id: String,
    pub receipt_type: ReceiptKind,
    pub from: Address,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignalNotice {
    pub from: Address,
    pub signal: SignalPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub peer_address: Address,
    pub messages: Vec<RelayedMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OnlineStatus {
    pub address: Address,
    pub online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub address: Address,
    pub public_key: String,
    pub online: bool,
    pub last_seen: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserResponse {
    #[serde(default)]
    pub user: Option<UserInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    pub address: Address,
    pub online: bool,
    pub last_seen: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorNotice {
    pub message: String,
}

// ---------------------------------------------------------------------------
// Signaling
// ---------------------------------------------------------------------------

/// Small payload exchanged over a signal channel. Negotiation messages and
/// typing indicators share the channel and are told apart by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SignalPayload {
    /// Initiator advertises an endpoint the peer should dial
    Offer(SessionOffer),
    /// Responder confirms it dialed the endpoint
    Answer(SessionRef),
    /// Additional endpoint for an offered session, tried if the first fails
    Candidate(SessionOffer),
    /// Either side tears the session down
    Hangup(SessionRef),
    Typing(TypingState),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionOffer {
    pub session: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRef {
    pub session: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub is_typing: bool,
}

// ---------------------------------------------------------------------------
// Direct channel
// ---------------------------------------------------------------------------

/// Application payload exchanged over a direct peer channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: String,
    pub from: Address,
    pub to: String,
    pub timestamp: i64,
    #[serde(flatten)]
    pub body: EnvelopeBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EnvelopeBody {
    DirectMessage(CipherBody),
    GroupMessage(GroupBody),
    StatusUpdate(StatusBody),
    TypingSignal(TypingState),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CipherBody {
    pub encrypted: String,
    pub nonce: String,
    pub sender_public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupBody {
    pub group_id: String,
    #[serde(flatten)]
    pub cipher: CipherBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusBody {
    pub message_id: String,
    pub status: MessageStatus,
}

impl Envelope {
    /// Relay form of a message envelope; `None` for non-message kinds.
    pub fn to_relayed(&self) -> Option<RelayedMessage> {
        let (cipher, group_id) = match &self.body {
            EnvelopeBody::DirectMessage(cipher) => (cipher, None),
            EnvelopeBody::GroupMessage(group) => (&group.cipher, Some(group.group_id.clone())),
            _ => return None,
        };
        Some(RelayedMessage {
            id: self.id.clone(),
            from: Some(self.from.clone()),
            to: Address::new(&self.to),
            encrypted: cipher.encrypted.clone(),
            nonce: cipher.nonce.clone(),
            sender_public_key: cipher.sender_public_key.clone(),
            timestamp: self.timestamp,
            group_id,
            status: None,
            sender_username: None,
        })
    }

    pub fn from_relayed(message: &RelayedMessage, from: Address) -> Self {
        let cipher = CipherBody {
            encrypted: message.encrypted.clone(),
            nonce: message.nonce.clone(),
            sender_public_key: message.sender_public_key.clone(),
        };
        let body = match &message.group_id {
            Some(group_id) => EnvelopeBody::GroupMessage(GroupBody {
                group_id: group_id.clone(),
                cipher,
            }),
            None => EnvelopeBody::DirectMessage(cipher),
        };
        Self {
            id: message.id.clone(),
            from,
            to: message.to.to_string(),
            timestamp: message.timestamp,
            body,
        }
    }
}

// ---------------------------------------------------------------------------
// Framing helpers
// ---------------------------------------------------------------------------

fn check_size(text: &str) -> Result<(), ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: text.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}

impl ClientRequest {
    pub fn new(request_id: Option<u64>, frame: ClientFrame) -> Self {
        Self { request_id, frame }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        check_size(text)?;
        Ok(serde_json::from_str(text)?)
    }
}

impl ServerResponse {
    pub fn push(frame: ServerFrame) -> Self {
        Self {
            request_id: None,
            frame,
        }
    }

    pub fn reply(request_id: Option<u64>, frame: ServerFrame) -> Self {
        Self { request_id, frame }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        check_size(text)?;
        Ok(serde_json::from_str(text)?)
    }
}
