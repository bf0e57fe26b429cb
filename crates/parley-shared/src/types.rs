use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::PUBKEY_SIZE;

/// Stable public identity: lowercase hex of the Ed25519 verifying key.
///
/// Addresses compare case-insensitively, so every constructor normalizes to
/// lowercase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn new(value: impl AsRef<str>) -> Self {
        Self(value.as_ref().trim().to_lowercase())
    }

    pub fn from_public_key(key: &[u8; 32]) -> Self {
        Self(hex::encode(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines.
    pub fn short(&self) -> &str {
        self.0
            .char_indices()
            .nth(8)
            .map_or(&self.0[..], |(end, _)| &self.0[..end])
    }

    /// Non-empty hex, no longer than an encoded public key.
    pub fn is_well_formed(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= PUBKEY_SIZE * 2
            && self.0.bytes().all(|b| b.is_ascii_hexdigit())
    }
}

impl From<String> for Address {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Conversation key used by the relay: the two participants in canonical
/// order, so both sides address the same history.
pub fn canonical_pair(a: &Address, b: &Address) -> String {
    if a <= b {
        format!("{a}:{b}")
    } else {
        format!("{b}:{a}")
    }
}

/// Current wall-clock time in Unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            other => Err(format!("unknown message status: {other}")),
        }
    }
}

/// How a message left (or failed to leave) this device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    P2p,
    Relay,
    Queued,
}

/// Quoted parent of a reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplyTo {
    pub id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
}

/// A chat message as held by a client.
///
/// `id` is the deduplication key everywhere. `content` is plaintext and never
/// leaves the device; `encrypted` / `nonce` are base64 and absent while the
/// message waits in the outbox for the recipient's key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub from: Address,
    /// Recipient address, or the group id for group messages.
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub encrypted: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
    pub sender_public_key: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<i64>,
    pub status: MessageStatus,
    pub transport: Transport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyTo>,
    #[serde(default)]
    pub decryption_failed: bool,
}

impl Message {
    /// Local ordering key. The receiver's own clock wins over the sender's
    /// because `timestamp` is sender-supplied.
    pub fn sort_key(&self) -> (i64, &str) {
        (self.saved_at.unwrap_or(self.timestamp), self.id.as_str())
    }

    /// Conversation this message is filed under, from `local`'s point of view.
    pub fn conversation_id(&self, local: &Address) -> String {
        if let Some(group) = &self.group_id {
            return group.to_lowercase();
        }
        if &self.from == local {
            self.to.to_lowercase()
        } else {
            self.from.as_str().to_string()
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted.is_some() && self.nonce.is_some()
    }
}

/// A message waiting for a confirmed send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    #[serde(flatten)]
    pub message: Message,
    pub queued_at: i64,
}

/// Contact or group summary, derived from observed traffic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    /// Peer address or group id, lowercase.
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<Address>,
    pub last_message_time: i64,
    pub unread_count: u32,
}

impl Contact {
    pub fn new(address: impl AsRef<str>) -> Self {
        Self {
            address: address.as_ref().to_lowercase(),
            username: None,
            is_group: false,
            members: Vec::new(),
            last_message_time: 0,
            unread_count: 0,
        }
    }

    pub fn group(group_id: impl AsRef<str>, members: Vec<Address>) -> Self {
        Self {
            is_group: true,
            members,
            ..Self::new(group_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, from: &str, to: &str) -> Message {
        Message {
            id: id.into(),
            from: Address::new(from),
            to: to.into(),
            group_id: None,
            content: String::new(),
            encrypted: None,
            nonce: None,
            sender_public_key: String::new(),
            timestamp: 10,
            saved_at: None,
            status: MessageStatus::Pending,
            transport: Transport::Queued,
            reply_to: None,
            decryption_failed: false,
        }
    }

    #[test]
    fn address_is_case_insensitive() {
        assert_eq!(Address::new("ABCdef"), Address::new("abcDEF"));
        let parsed: Address = serde_json::from_str("\"ABC\"").unwrap();
        assert_eq!(parsed.as_str(), "abc");
    }

    #[test]
    fn short_form_respects_char_boundaries() {
        assert_eq!(Address::new("aaaaaaaé").short(), "aaaaaaaé");
        assert_eq!(Address::new("ééééééééé").short(), "éééééééé");
        assert_eq!(Address::new("0123456789abcdef").short(), "01234567");
        assert_eq!(Address::new("ab").short(), "ab");
    }

    #[test]
    fn only_hex_addresses_are_well_formed() {
        assert!(Address::from_public_key(&[7; 32]).is_well_formed());
        assert!(Address::new("AB").is_well_formed());
        assert!(!Address::new("").is_well_formed());
        assert!(!Address::new("aaaaaaaé").is_well_formed());
        assert!(!Address::new("zz").is_well_formed());
        assert!(!Address::new("a".repeat(65)).is_well_formed());
    }

    #[test]
    fn canonical_pair_is_symmetric() {
        let a = Address::new("aa");
        let b = Address::new("bb");
        assert_eq!(canonical_pair(&a, &b), canonical_pair(&b, &a));
        assert_eq!(canonical_pair(&a, &b), "aa:bb");
    }

    #[test]
    fn saved_at_takes_precedence_in_sort_key() {
        let mut m = message("m1", "aa", "bb");
        assert_eq!(m.sort_key(), (10, "m1"));
        m.saved_at = Some(99);
        assert_eq!(m.sort_key(), (99, "m1"));
    }

    #[test]
    fn conversation_id_depends_on_direction() {
        let local = Address::new("aa");
        let outbound = message("m1", "aa", "BB");
        assert_eq!(outbound.conversation_id(&local), "bb");

        let inbound = message("m2", "bb", "aa");
        assert_eq!(inbound.conversation_id(&local), "bb");

        let mut group = message("m3", "bb", "Team");
        group.group_id = Some("Team".into());
        assert_eq!(group.conversation_id(&local), "team");
    }

    #[test]
    fn message_status_wire_names() {
        let json = serde_json::to_string(&MessageStatus::Delivered).unwrap();
        assert_eq!(json, "\"delivered\"");
        assert_eq!("read".parse::<MessageStatus>().unwrap(), MessageStatus::Read);
        assert!("lost".parse::<MessageStatus>().is_err());
        assert_eq!(serde_json::to_string(&Transport::P2p).unwrap(), "\"p2p\"");
    }
}
