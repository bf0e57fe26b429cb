//! Event streams for a UI.
//!
//! One bounded stream per category. Hold the [`Subscription`] for as long
//! as events are wanted; dropping it unsubscribes.

use parley_net::{Subscribers, Subscription};
use parley_shared::protocol::PresenceUpdate;
use parley_shared::{Address, Message, MessageStatus};
use serde::Serialize;

/// A message was stored. `visible` is set when it belongs to the open
/// conversation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    pub message: Message,
    pub visible: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptEvent {
    pub message_id: String,
    pub status: MessageStatus,
    pub from: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    pub from: Address,
    pub group_id: Option<String>,
    pub is_typing: bool,
}

/// Status change of an outbound message, reported while flushing the outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendProgress {
    pub id: String,
    pub status: MessageStatus,
}

pub struct EventHub {
    messages: Subscribers<MessageEvent>,
    receipts: Subscribers<ReceiptEvent>,
    presence: Subscribers<PresenceUpdate>,
    typing: Subscribers<TypingEvent>,
    progress: Subscribers<SendProgress>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: Subscribers::new(capacity),
            receipts: Subscribers::new(capacity),
            presence: Subscribers::new(capacity),
            typing: Subscribers::new(capacity),
            progress: Subscribers::new(capacity),
        }
    }

    pub fn messages(&self) -> Subscription<MessageEvent> {
        self.messages.subscribe()
    }

    pub fn receipts(&self) -> Subscription<ReceiptEvent> {
        self.receipts.subscribe()
    }

    pub fn presence(&self) -> Subscription<PresenceUpdate> {
        self.presence.subscribe()
    }

    pub fn typing(&self) -> Subscription<TypingEvent> {
        self.typing.subscribe()
    }

    pub fn progress(&self) -> Subscription<SendProgress> {
        self.progress.subscribe()
    }

    pub(crate) fn message(&self, message: Message, visible: bool) {
        self.messages.publish(MessageEvent { message, visible });
    }

    pub(crate) fn receipt(&self, event: ReceiptEvent) {
        self.receipts.publish(event);
    }

    pub(crate) fn presence_changed(&self, update: PresenceUpdate) {
        self.presence.publish(update);
    }

    pub(crate) fn typing_changed(&self, event: TypingEvent) {
        self.typing.publish(event);
    }

    pub(crate) fn progressed(&self, progress: SendProgress) {
        self.progress.publish(progress);
    }
}
