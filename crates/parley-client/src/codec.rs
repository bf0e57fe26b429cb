//! Converting between local [`Message`]s and their encrypted wire forms.

use parley_shared::constants::DECRYPTION_FAILED_PLACEHOLDER;
use parley_shared::crypto;
use parley_shared::protocol::{MessageContent, RelayedMessage};
use parley_shared::types::now_ms;
use parley_shared::{Address, Identity, Message, MessageStatus, Transport};
use tracing::debug;

use crate::error::Result;

/// Encrypt `message`'s text and quoted reply for `recipient_key` (base64)
/// and return the relay form addressed to `to`. Fills in `encrypted`,
/// `nonce` and `sender_public_key` on `message`.
pub fn seal(
    identity: &Identity,
    recipient_key: &str,
    message: &mut Message,
    to: &Address,
) -> Result<RelayedMessage> {
    let recipient = crypto::decode_key(recipient_key)?;
    let content = MessageContent {
        text: message.content.clone(),
        reply_to: message.reply_to.clone(),
    };
    let sealed = crypto::encrypt(&content.to_bytes()?, &recipient, identity.secret_key())?;
    let encrypted = crypto::encode_b64(&sealed.ciphertext);
    let nonce = crypto::encode_b64(&sealed.nonce);
    message.encrypted = Some(encrypted.clone());
    message.nonce = Some(nonce.clone());
    message.sender_public_key = identity.public_key_b64();

    Ok(RelayedMessage {
        id: message.id.clone(),
        from: Some(message.from.clone()),
        to: to.clone(),
        encrypted,
        nonce,
        sender_public_key: message.sender_public_key.clone(),
        timestamp: message.timestamp,
        group_id: message.group_id.clone(),
        status: None,
        sender_username: None,
    })
}

/// Relay form of a sealed message for `to`. `None` if it was never sealed.
pub fn to_relayed(message: &Message, to: &Address) -> Option<RelayedMessage> {
    Some(RelayedMessage {
        id: message.id.clone(),
        from: Some(message.from.clone()),
        to: to.clone(),
        encrypted: message.encrypted.clone()?,
        nonce: message.nonce.clone()?,
        sender_public_key: message.sender_public_key.clone(),
        timestamp: message.timestamp,
        group_id: message.group_id.clone(),
        status: None,
        sender_username: None,
    })
}

/// Open a received message.
///
/// `counterparty_key` is the other side's public key: the sender's for
/// inbound messages, the recipient's for our own. A message that cannot
/// be opened is kept with placeholder content and `decryption_failed`.
/// Returns `None` when the relay did not say who sent it.
pub fn open(
    identity: &Identity,
    relayed: &RelayedMessage,
    counterparty_key: &str,
    transport: Transport,
) -> Option<Message> {
    let from = relayed.from.clone()?;
    let opened = crypto::decode_key(counterparty_key).and_then(|key| {
        let ciphertext = crypto::decode_b64(&relayed.encrypted)?;
        let nonce = crypto::decode_b64(&relayed.nonce)?;
        crypto::decrypt(&ciphertext, &nonce, &key, identity.secret_key())
    });

    let (content, decryption_failed) = match opened {
        Ok(bytes) => (MessageContent::from_bytes(&bytes), false),
        Err(e) => {
            debug!(id = %relayed.id, error = %e, "message could not be decrypted");
            let placeholder = MessageContent {
                text: DECRYPTION_FAILED_PLACEHOLDER.to_string(),
                reply_to: None,
            };
            (placeholder, true)
        }
    };

    Some(Message {
        id: relayed.id.clone(),
        from,
        to: relayed
            .group_id
            .clone()
            .unwrap_or_else(|| relayed.to.to_string()),
        group_id: relayed.group_id.clone(),
        content: content.text,
        encrypted: Some(relayed.encrypted.clone()),
        nonce: Some(relayed.nonce.clone()),
        sender_public_key: relayed.sender_public_key.clone(),
        timestamp: relayed.timestamp,
        saved_at: Some(now_ms()),
        status: relayed.status.unwrap_or(MessageStatus::Sent),
        transport,
        reply_to: content.reply_to,
        decryption_failed,
    })
}
