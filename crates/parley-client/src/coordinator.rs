//! Delivery coordinator.
//!
//! Every outbound message takes the first route that works:
//!
//! 1. the direct peer link, if one is up,
//! 2. the relay,
//! 3. the local outbox, flushed on the next reconnect.
//!
//! Every inbound message, whichever route it took, goes through
//! [`DeliveryCoordinator::handle_incoming`]: it is opened, deduplicated by
//! id, persisted, folded into the contact list and announced on the event
//! streams.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};

use parley_net::{ConnectionManager, PeerState, PublicKeyInfo, RelayApi, SignalChannel};
use parley_shared::protocol::{
    Envelope, EnvelopeBody, ReceiptKind, RegisteredUser, RelayedMessage, ServerFrame,
    SignalPayload, StatusBody, TypingState, UserSummary, UsernameResult,
};
use parley_shared::types::now_ms;
use parley_shared::{
    Address, Contact, Identity, Message, MessageStatus, OutboxEntry, ReplyTo, Transport,
};
use parley_store::LocalStore;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::codec;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::events::{EventHub, ReceiptEvent, SendProgress, TypingEvent};
use crate::state::{ContactBook, OpenConversation, ViewState};
use crate::typing::TypingTracker;

const SENT_IDS_CAP: usize = 4_096;

/// The routes a coordinator can use.
#[derive(Clone)]
pub struct Transports {
    pub relay: Arc<dyn RelayApi>,
    pub signals: Arc<dyn SignalChannel>,
    pub connections: ConnectionManager,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueReason {
    /// The relay does not know the recipient's key yet.
    UnknownRecipientKey,
    /// Neither the direct link nor the relay accepted the message.
    RelayUnreachable,
}

/// Result of [`DeliveryCoordinator::send`]. A queued message is not an
/// error: it will go out on the next flush.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    Sent(Message),
    Queued { message: Message, reason: QueueReason },
}

impl SendOutcome {
    pub fn message(&self) -> &Message {
        match self {
            Self::Sent(message) | Self::Queued { message, .. } => message,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub sent: usize,
    pub failed: usize,
}

/// What [`DeliveryCoordinator::resume`] did after a reconnect.
#[derive(Debug, Clone)]
pub struct ResumeSummary {
    pub registered: RegisteredUser,
    pub flushed: FlushSummary,
    pub merged: usize,
}

enum Delivery {
    Sent(Transport),
    Queued(QueueReason),
}

// Ids of messages this device sent, so their relay echoes are dropped.
#[derive(Default)]
struct SentIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SentIds {
    fn insert(&mut self, id: &str) {
        if self.ids.insert(id.to_string()) {
            self.order.push_back(id.to_string());
        }
        while self.order.len() > SENT_IDS_CAP {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }
}

pub struct DeliveryCoordinator {
    local: Address,
    identity: RwLock<Option<Identity>>,
    store: Arc<LocalStore>,
    relay: Arc<dyn RelayApi>,
    signals: Arc<dyn SignalChannel>,
    connections: ConnectionManager,
    events: EventHub,
    contacts: tokio::sync::Mutex<ContactBook>,
    view: Mutex<ViewState>,
    sent_ids: Mutex<SentIds>,
    typing: Mutex<TypingTracker>,
    keys: Mutex<HashMap<Address, String>>,
    config: ClientConfig,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl DeliveryCoordinator {
    /// Coordinator for a freshly derived identity. Its key material is
    /// saved so the device can [`restore`](Self::restore) later.
    pub async fn new(
        identity: Identity,
        store: Arc<LocalStore>,
        transports: Transports,
        config: ClientConfig,
    ) -> Result<Arc<Self>> {
        let address = identity.address();
        store
            .save_key_material(address.as_str(), identity.seed())
            .await?;
        Self::build(address, Some(identity), store, transports, config).await
    }

    /// Coordinator for an identity whose key material is already stored.
    pub async fn restore(
        address: &Address,
        store: Arc<LocalStore>,
        transports: Transports,
        config: ClientConfig,
    ) -> Result<Arc<Self>> {
        let seed = store
            .load_key_material(address.as_str())
            .await?
            .ok_or_else(|| ClientError::NoKeyMaterial(address.to_string()))?;
        let identity = Identity::from_seed(seed);
        Self::build(address.clone(), Some(identity), store, transports, config).await
    }

    async fn build(
        local: Address,
        identity: Option<Identity>,
        store: Arc<LocalStore>,
        transports: Transports,
        config: ClientConfig,
    ) -> Result<Arc<Self>> {
        let contacts = ContactBook::from_contacts(store.list_contacts().await?);
        Ok(Arc::new(Self {
            local,
            identity: RwLock::new(identity),
            store,
            relay: transports.relay,
            signals: transports.signals,
            connections: transports.connections,
            events: EventHub::new(config.event_capacity),
            contacts: tokio::sync::Mutex::new(contacts),
            view: Mutex::new(ViewState::default()),
            sent_ids: Mutex::new(SentIds::default()),
            typing: Mutex::new(TypingTracker::new(config.typing_expiry)),
            keys: Mutex::new(HashMap::new()),
            config,
        }))
    }

    pub fn local(&self) -> &Address {
        &self.local
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn identity(&self) -> Result<Identity> {
        self.identity
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| ClientError::NoKeyMaterial(self.local.to_string()))
    }

    /// Forget the in-memory keys. Sends and flushes fail until the
    /// coordinator is restored.
    pub fn sign_out(&self) {
        *self.identity.write().unwrap_or_else(|e| e.into_inner()) = None;
        info!(address = %self.local.short(), "signed out");
    }

    // -- background tasks ----------------------------------------------------

    /// Spawn the tasks feeding inbound traffic into the coordinator: relay
    /// deliveries, other relay pushes, signal payloads, direct-link payloads
    /// and typing expiry. They stop once the coordinator is dropped.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut deliveries = self.relay.subscribe_deliveries();
        let weak = Arc::downgrade(self);
        let delivery_loop = tokio::spawn(async move {
            while let Some(frame) = deliveries.recv().await {
                let Some(this) = weak.upgrade() else { break };
                this.on_relay_frame(frame).await;
            }
            debug!("relay delivery pump stopped");
        });

        let mut relay_pushes = self.relay.subscribe();
        let weak = Arc::downgrade(self);
        let relay_loop = tokio::spawn(async move {
            while let Some(frame) = relay_pushes.recv().await {
                let Some(this) = weak.upgrade() else { break };
                this.on_relay_frame(frame).await;
            }
            debug!("relay pump stopped");
        });

        let mut signals = self.signals.subscribe();
        let weak = Arc::downgrade(self);
        let signal_loop = tokio::spawn(async move {
            while let Some(envelope) = signals.recv().await {
                let SignalPayload::Typing(state) = envelope.payload else {
                    continue;
                };
                let Some(this) = weak.upgrade() else { break };
                this.on_typing(&envelope.from, state);
            }
            debug!("signal pump stopped");
        });

        let mut direct = self.connections.subscribe_data();
        let weak = Arc::downgrade(self);
        let direct_loop = tokio::spawn(async move {
            while let Some((peer, payload)) = direct.recv().await {
                let Some(this) = weak.upgrade() else { break };
                this.on_direct_payload(peer, payload).await;
            }
            debug!("direct pump stopped");
        });

        let expiry_loop = spawn_typing_expiry(Arc::downgrade(self), self.config.typing_expiry);

        vec![delivery_loop, relay_loop, signal_loop, direct_loop, expiry_loop]
    }

    async fn on_relay_frame(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::Message(message) | ServerFrame::MessageSent(message) => {
                if let Err(e) = self.handle_incoming(message, Transport::Relay).await {
                    warn!(error = %e, "inbound relay message not stored");
                }
            }
            ServerFrame::MessageReceipt(receipt) => {
                self.apply_receipt(&receipt.message_id, receipt.receipt_type.into(), &receipt.from)
                    .await;
            }
            ServerFrame::UserStatus(update) => self.events.presence_changed(update),
            ServerFrame::Error(notice) => warn!(reason = %notice.message, "relay error"),
            _ => {}
        }
    }

    async fn on_direct_payload(&self, peer: Address, payload: Value) {
        let envelope: Envelope = match serde_json::from_value(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(peer = %peer.short(), error = %e, "ignoring undecodable direct payload");
                return;
            }
        };
        if envelope.from != peer {
            warn!(peer = %peer.short(), claimed = %envelope.from.short(), "direct payload with forged sender");
            return;
        }

        match &envelope.body {
            EnvelopeBody::DirectMessage(_) | EnvelopeBody::GroupMessage(_) => {
                let Some(relayed) = envelope.to_relayed() else { return };
                if let Err(e) = self.handle_incoming(relayed, Transport::P2p).await {
                    warn!(error = %e, "inbound direct message not stored");
                }
            }
            EnvelopeBody::StatusUpdate(update) => {
                self.apply_receipt(&update.message_id, update.status, &peer).await;
            }
            EnvelopeBody::TypingSignal(state) => self.on_typing(&peer, state.clone()),
        }
    }

    // -- sending -------------------------------------------------------------

    fn draft(
        &self,
        identity: &Identity,
        to: String,
        group_id: Option<String>,
        text: &str,
        reply_to: Option<ReplyTo>,
    ) -> Message {
        let now = now_ms();
        Message {
            id: Uuid::new_v4().to_string(),
            from: self.local.clone(),
            to,
            group_id,
            content: text.to_string(),
            encrypted: None,
            nonce: None,
            sender_public_key: identity.public_key_b64(),
            timestamp: now,
            saved_at: Some(now),
            status: MessageStatus::Pending,
            transport: Transport::Queued,
            reply_to,
            decryption_failed: false,
        }
    }

    /// Send a direct message.
    ///
    /// Fails only without key material or local storage. An unreachable
    /// recipient yields [`SendOutcome::Queued`].
    pub async fn send(
        &self,
        to: &Address,
        text: &str,
        reply_to: Option<ReplyTo>,
    ) -> Result<SendOutcome> {
        let identity = self.identity()?;
        let mut message = self.draft(&identity, to.to_string(), None, text, reply_to);

        let outcome = match self.deliver(&identity, to, &message).await? {
            Delivery::Sent(transport) => {
                message.status = MessageStatus::Sent;
                message.transport = transport;
                SendOutcome::Sent(message.clone())
            }
            Delivery::Queued(reason) => SendOutcome::Queued {
                message: message.clone(),
                reason,
            },
        };

        self.record_outbound(&message).await?;
        debug!(id = %message.id, to = %to.short(), transport = ?message.transport, "sent");
        Ok(outcome)
    }

    /// Send to every member of a known group. Each member gets its own
    /// ciphertext under the same message id.
    pub async fn send_group(
        &self,
        group_id: &str,
        text: &str,
        reply_to: Option<ReplyTo>,
    ) -> Result<SendOutcome> {
        let identity = self.identity()?;
        let group_id = group_id.to_lowercase();
        let members = {
            let contacts = self.contacts.lock().await;
            match contacts.get(&group_id) {
                Some(group) if group.is_group => group.members.clone(),
                _ => return Err(ClientError::UnknownConversation(group_id)),
            }
        };

        let mut message =
            self.draft(&identity, group_id.clone(), Some(group_id.clone()), text, reply_to);
        let mut sent_via = None;
        let mut queued = None;
        for member in members.iter().filter(|m| **m != self.local) {
            let mut copy = message.clone();
            copy.to = member.to_string();
            match self.deliver(&identity, member, &copy).await? {
                Delivery::Sent(transport) => {
                    sent_via = match sent_via {
                        Some(Transport::Relay) => Some(Transport::Relay),
                        _ => Some(transport),
                    }
                }
                Delivery::Queued(reason) => queued = queued.or(Some(reason)),
            }
        }

        if let Some(transport) = sent_via {
            message.status = MessageStatus::Sent;
            message.transport = transport;
        }
        self.record_outbound(&message).await?;

        Ok(match queued {
            Some(reason) => SendOutcome::Queued { message, reason },
            None => SendOutcome::Sent(message),
        })
    }

    // One recipient: direct link, then relay, then outbox.
    async fn deliver(
        &self,
        identity: &Identity,
        recipient: &Address,
        message: &Message,
    ) -> Result<Delivery> {
        let Some(key) = self.resolve_key(recipient).await else {
            debug!(id = %message.id, to = %recipient.short(), "recipient key unknown, queuing");
            self.queue(message.clone()).await?;
            return Ok(Delivery::Queued(QueueReason::UnknownRecipientKey));
        };

        let mut sealed = message.clone();
        let relayed = match codec::seal(identity, &key.public_key, &mut sealed, recipient) {
            Ok(relayed) => relayed,
            Err(e) => {
                warn!(to = %recipient.short(), error = %e, "recipient key unusable, queuing");
                self.queue(message.clone()).await?;
                return Ok(Delivery::Queued(QueueReason::UnknownRecipientKey));
            }
        };
        lock(&self.sent_ids).insert(&message.id);

        let envelope = Envelope::from_relayed(&relayed, self.local.clone());
        if self.connections.send(recipient, &envelope).await {
            return Ok(Delivery::Sent(Transport::P2p));
        }
        if key.online {
            self.try_direct(recipient);
        }

        match self.relay.send_message(relayed).await {
            Ok(status) => {
                trace!(id = %message.id, ?status, "relay accepted");
                Ok(Delivery::Sent(Transport::Relay))
            }
            Err(e) => {
                warn!(id = %message.id, error = %e, "relay unreachable, queuing");
                self.queue(sealed).await?;
                Ok(Delivery::Queued(QueueReason::RelayUnreachable))
            }
        }
    }

    async fn queue(&self, mut message: Message) -> Result<()> {
        message.status = MessageStatus::Pending;
        message.transport = Transport::Queued;
        let entry = OutboxEntry {
            message,
            queued_at: now_ms(),
        };
        self.store.enqueue(&entry).await?;
        Ok(())
    }

    async fn record_outbound(&self, message: &Message) -> Result<()> {
        let conversation = message.conversation_id(&self.local);
        self.store.append_message(&conversation, message).await?;

        let mut contacts = self.contacts.lock().await;
        let contact = contacts.observe_message(message, &self.local, true).clone();
        self.store.upsert_contact(&contact).await?;
        Ok(())
    }

    // Public key of `peer`, from the relay or, when it cannot be asked,
    // from the last successful lookup.
    async fn resolve_key(&self, peer: &Address) -> Option<PublicKeyInfo> {
        if self.relay.is_connected() {
            match self.relay.get_public_key(peer).await {
                Ok(Some(info)) => {
                    lock(&self.keys).insert(peer.clone(), info.public_key.clone());
                    return Some(info);
                }
                Ok(None) => return None,
                Err(e) => debug!(peer = %peer.short(), error = %e, "key lookup failed"),
            }
        }
        lock(&self.keys).get(peer).map(|public_key| PublicKeyInfo {
            public_key: public_key.clone(),
            online: false,
        })
    }

    // Start negotiating a direct link so later messages can skip the relay.
    fn try_direct(&self, peer: &Address) {
        if matches!(
            self.connections.state(peer),
            PeerState::Connecting | PeerState::Connected
        ) {
            return;
        }
        let connections = self.connections.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            if connections.connect(&peer, true).await.is_none() {
                trace!(peer = %peer.short(), "direct link not offered");
            }
        });
    }

    // -- outbox --------------------------------------------------------------

    /// Deliver queued messages through the relay.
    ///
    /// Entries stay queued while the relay is unreachable or the
    /// recipient's key is still unknown; the rest are sent, dequeued and
    /// reported as `sent` on `progress` and the progress stream. Only
    /// missing key material is an error.
    pub async fn flush_pending_messages(
        &self,
        progress: Option<&mpsc::Sender<SendProgress>>,
    ) -> Result<FlushSummary> {
        let identity = self.identity()?;
        let pending = self.store.list_pending().await?;
        let mut summary = FlushSummary::default();

        if !self.relay.is_connected() {
            summary.failed = pending.len();
            debug!(retained = summary.failed, "relay offline, outbox retained");
            return Ok(summary);
        }

        for entry in pending {
            let mut message = entry.message;
            let recipient = Address::new(&message.to);

            let relayed = match codec::to_relayed(&message, &recipient) {
                Some(relayed) => relayed,
                None => {
                    let Some(key) = self.resolve_key(&recipient).await else {
                        trace!(id = %message.id, "recipient key still unknown");
                        summary.failed += 1;
                        continue;
                    };
                    match codec::seal(&identity, &key.public_key, &mut message, &recipient) {
                        Ok(relayed) => relayed,
                        Err(e) => {
                            warn!(id = %message.id, error = %e, "cannot seal queued message");
                            summary.failed += 1;
                            continue;
                        }
                    }
                }
            };

            lock(&self.sent_ids).insert(&message.id);
            if let Err(e) = self.relay.send_message(relayed).await {
                debug!(id = %message.id, error = %e, "queued message not accepted");
                summary.failed += 1;
                continue;
            }

            if let Err(e) = self.mark_flushed(&message, &recipient).await {
                warn!(id = %message.id, error = %e, "sent but outbox not updated");
            }
            let update = SendProgress {
                id: message.id.clone(),
                status: MessageStatus::Sent,
            };
            if let Some(progress) = progress {
                let _ = progress.send(update.clone()).await;
            }
            self.events.progressed(update);
            summary.sent += 1;
        }

        info!(sent = summary.sent, failed = summary.failed, "outbox flushed");
        Ok(summary)
    }

    async fn mark_flushed(&self, message: &Message, recipient: &Address) -> Result<()> {
        self.store.dequeue(&message.id, recipient.as_str()).await?;
        let conversation = message.conversation_id(&self.local);
        self.store
            .update_status(&conversation, &message.id, MessageStatus::Sent)
            .await?;
        Ok(())
    }

    // -- receiving -----------------------------------------------------------

    /// Open, deduplicate and store one inbound message. Returns the stored
    /// message, or `None` when it was an echo or a duplicate.
    pub async fn handle_incoming(
        &self,
        relayed: RelayedMessage,
        transport: Transport,
    ) -> Result<Option<Message>> {
        let Some(from) = relayed.from.clone() else {
            debug!(id = %relayed.id, "message without sender ignored");
            return Ok(None);
        };
        let identity = self.identity()?;

        let counterparty_key = if from == self.local {
            if lock(&self.sent_ids).contains(&relayed.id) {
                trace!(id = %relayed.id, "own echo dropped");
                return Ok(None);
            }
            match self.resolve_key(&relayed.to).await {
                Some(key) => key.public_key,
                None => String::new(),
            }
        } else {
            relayed.sender_public_key.clone()
        };

        let Some(message) = codec::open(&identity, &relayed, &counterparty_key, transport) else {
            return Ok(None);
        };
        self.store_incoming(message).await
    }

    async fn store_incoming(&self, message: Message) -> Result<Option<Message>> {
        let conversation = message.conversation_id(&self.local);
        if !self.store.append_message(&conversation, &message).await? {
            trace!(id = %message.id, "duplicate message ignored");
            return Ok(None);
        }

        let visible = lock(&self.view).is_visible(&message);
        {
            let mut contacts = self.contacts.lock().await;
            let contact = contacts
                .observe_message(&message, &self.local, visible)
                .clone();
            self.store.upsert_contact(&contact).await?;
        }

        if message.from != self.local {
            self.send_receipt(&message, ReceiptKind::Delivered).await;
            if visible {
                self.send_receipt(&message, ReceiptKind::Read).await;
            }
        }

        debug!(id = %message.id, from = %message.from.short(), %conversation, visible, "stored inbound message");
        self.events.message(message.clone(), visible);
        Ok(Some(message))
    }

    // Receipts take the direct link when there is one; the relay only knows
    // about messages it carried.
    async fn send_receipt(&self, message: &Message, kind: ReceiptKind) {
        let status: MessageStatus = kind.into();
        if message.transport == Transport::P2p {
            let envelope = Envelope {
                id: Uuid::new_v4().to_string(),
                from: self.local.clone(),
                to: message.from.to_string(),
                timestamp: now_ms(),
                body: EnvelopeBody::StatusUpdate(StatusBody {
                    message_id: message.id.clone(),
                    status,
                }),
            };
            if self.connections.send(&message.from, &envelope).await {
                return;
            }
        }
        if let Err(e) = self.relay.send_receipt(&message.id, &message.from, kind).await {
            debug!(id = %message.id, error = %e, "receipt not sent");
        }
    }

    async fn apply_receipt(&self, message_id: &str, status: MessageStatus, from: &Address) {
        let mut conversations = vec![from.as_str().to_string()];
        {
            let contacts = self.contacts.lock().await;
            conversations.extend(
                contacts
                    .sorted()
                    .into_iter()
                    .filter(|c| c.is_group && c.members.contains(from))
                    .map(|c| c.address),
            );
        }

        for conversation in conversations {
            match self.store.update_status(&conversation, message_id, status).await {
                Ok(true) => {
                    self.events.receipt(ReceiptEvent {
                        message_id: message_id.to_string(),
                        status,
                        from: from.clone(),
                    });
                    return;
                }
                Ok(false) => {}
                Err(e) => warn!(id = %message_id, error = %e, "receipt not applied"),
            }
        }
        trace!(id = %message_id, "receipt for unknown message");
    }

    // -- reconciliation ------------------------------------------------------

    /// Merge the relay's history for every direct contact into the local
    /// logs. New inbound messages count as unread except in the open
    /// conversation. Returns how many messages were new.
    pub async fn reconcile(&self) -> Result<usize> {
        let identity = self.identity()?;
        let peers: Vec<Address> = {
            let contacts = self.contacts.lock().await;
            contacts
                .sorted()
                .into_iter()
                .filter(|c| !c.is_group)
                .map(|c| Address::new(&c.address))
                .collect()
        };
        let open = lock(&self.view).conversation_id();

        let mut merged = 0;
        for peer in peers {
            let history = match self.relay.get_history(&peer).await {
                Ok(history) => history,
                Err(e) => {
                    warn!(peer = %peer.short(), error = %e, "history not fetched");
                    continue;
                }
            };
            if history.is_empty() {
                continue;
            }

            let peer_key = if history.iter().any(|m| m.from.as_ref() == Some(&self.local)) {
                self.resolve_key(&peer).await.map(|k| k.public_key)
            } else {
                None
            };

            let mut by_conversation: BTreeMap<String, Vec<Message>> = BTreeMap::new();
            for relayed in &history {
                let counterparty = if relayed.from.as_ref() == Some(&self.local) {
                    peer_key.clone().unwrap_or_default()
                } else {
                    relayed.sender_public_key.clone()
                };
                if let Some(message) = codec::open(&identity, relayed, &counterparty, Transport::Relay) {
                    by_conversation
                        .entry(message.conversation_id(&self.local))
                        .or_default()
                        .push(message);
                }
            }

            for (conversation, messages) in by_conversation {
                merged += self
                    .merge_history(&conversation, messages, open.as_deref() == Some(&conversation))
                    .await?;
            }
        }

        info!(merged, "reconciled with relay history");
        Ok(merged)
    }

    async fn merge_history(
        &self,
        conversation: &str,
        messages: Vec<Message>,
        is_open: bool,
    ) -> Result<usize> {
        let inserted: HashSet<String> = self
            .store
            .append_messages_bulk(conversation, &messages)
            .await?
            .into_iter()
            .collect();
        if inserted.is_empty() {
            return Ok(0);
        }

        let fresh: Vec<Message> = messages
            .into_iter()
            .filter(|m| inserted.contains(&m.id))
            .collect();
        let unread = fresh
            .iter()
            .filter(|m| m.from != self.local && m.status != MessageStatus::Read)
            .count();
        let latest = fresh.iter().map(|m| m.sort_key().0).max().unwrap_or(0);

        {
            let mut contacts = self.contacts.lock().await;
            if let Some(first) = fresh.first() {
                contacts.observe_message(first, &self.local, true);
            }
            let count = if is_open { 0 } else { u32::try_from(unread).unwrap_or(u32::MAX) };
            if let Some(contact) = contacts.apply_unread(conversation, count, latest) {
                let contact = contact.clone();
                self.store.upsert_contact(&contact).await?;
            }
        }

        for message in &fresh {
            if message.from != self.local && message.status != MessageStatus::Read {
                self.send_receipt(message, ReceiptKind::Delivered).await;
                if is_open {
                    self.send_receipt(message, ReceiptKind::Read).await;
                }
            }
            self.events.message(message.clone(), is_open);
        }

        debug!(%conversation, new = fresh.len(), unread, "merged history");
        Ok(fresh.len())
    }

    /// Re-register with the relay, flush the outbox and reconcile history.
    /// Call after every (re)connect. A username already held is kept when
    /// `username` is `None`.
    pub async fn resume(&self, username: Option<&str>) -> Result<ResumeSummary> {
        let identity = self.identity()?;
        let registered = self
            .relay
            .register(&self.local, &identity.public_key_b64(), username)
            .await?;
        let flushed = self.flush_pending_messages(None).await?;
        let merged = self.reconcile().await?;
        Ok(ResumeSummary {
            registered,
            flushed,
            merged,
        })
    }

    // -- conversations and contacts ------------------------------------------

    /// Open a conversation: it becomes the visible one, its unread count is
    /// cleared and unread inbound messages are acknowledged as read.
    /// Returns its history, oldest first.
    pub async fn open_conversation(&self, conversation: OpenConversation) -> Result<Vec<Message>> {
        lock(&self.view).open(conversation.clone());
        let id = match &conversation {
            OpenConversation::Peer(peer) => peer.as_str().to_string(),
            OpenConversation::Group(group) => group.to_lowercase(),
        };

        {
            let mut contacts = self.contacts.lock().await;
            if let Some(contact) = contacts.mark_read(&id) {
                let contact = contact.clone();
                self.store.upsert_contact(&contact).await?;
            }
        }

        let mut history = self.store.read_history(&id).await?;
        for message in history.iter_mut() {
            if message.from == self.local || message.status == MessageStatus::Read {
                continue;
            }
            self.send_receipt(message, ReceiptKind::Read).await;
            self.store
                .update_status(&id, &message.id, MessageStatus::Read)
                .await?;
            message.status = MessageStatus::Read;
        }

        if let OpenConversation::Peer(peer) = &conversation {
            if self.relay.check_online(peer).await.unwrap_or(false) {
                self.try_direct(peer);
            }
        }
        Ok(history)
    }

    pub fn close_conversation(&self) {
        lock(&self.view).close();
    }

    pub async fn contacts(&self) -> Vec<Contact> {
        self.contacts.lock().await.sorted()
    }

    pub async fn history(&self, conversation_id: &str) -> Result<Vec<Message>> {
        Ok(self.store.read_history(conversation_id).await?)
    }

    /// Pending outbox entries for `address`, oldest first.
    pub async fn pending_for(&self, address: &Address) -> Result<Vec<OutboxEntry>> {
        Ok(self.store.list_pending_for(address.as_str()).await?)
    }

    pub async fn set_username(&self, username: &str) -> Result<UsernameResult> {
        Ok(self.relay.set_username(username).await?)
    }

    /// Resolve `username` and add its owner as a contact.
    pub async fn add_contact_by_username(&self, username: &str) -> Result<Option<UserSummary>> {
        let Some(user) = self.relay.lookup_by_username(username).await? else {
            return Ok(None);
        };
        lock(&self.keys).insert(user.address.clone(), user.public_key.clone());

        let mut contacts = self.contacts.lock().await;
        contacts.ensure(Contact::new(user.address.as_str()));
        if let Some(contact) = contacts.set_username(user.address.as_str(), Some(user.username.clone())) {
            let contact = contact.clone();
            self.store.upsert_contact(&contact).await?;
        }
        Ok(Some(user))
    }

    pub async fn create_group(&self, group_id: &str, members: Vec<Address>) -> Result<Contact> {
        let mut contacts = self.contacts.lock().await;
        let contact = contacts.ensure(Contact::group(group_id, members)).clone();
        self.store.upsert_contact(&contact).await?;
        Ok(contact)
    }

    // -- typing --------------------------------------------------------------

    /// Tell the other side of `conversation` whether we are typing.
    pub async fn send_typing(&self, conversation: &OpenConversation, is_typing: bool) -> Result<()> {
        let (recipients, group_id) = match conversation {
            OpenConversation::Peer(peer) => (vec![peer.clone()], None),
            OpenConversation::Group(group) => {
                let contacts = self.contacts.lock().await;
                let members = contacts
                    .get(group)
                    .map(|c| c.members.clone())
                    .ok_or_else(|| ClientError::UnknownConversation(group.clone()))?;
                (members, Some(group.to_lowercase()))
            }
        };

        for recipient in recipients.iter().filter(|r| **r != self.local) {
            let state = TypingState {
                group_id: group_id.clone(),
                is_typing,
            };
            if let Err(e) = self
                .signals
                .send_signal(recipient, SignalPayload::Typing(state))
                .await
            {
                debug!(to = %recipient.short(), error = %e, "typing signal not sent");
            }
        }
        Ok(())
    }

    fn on_typing(&self, from: &Address, state: TypingState) {
        let changed = lock(&self.typing).observe(
            from,
            state.group_id.as_deref(),
            state.is_typing,
            Instant::now(),
        );
        if changed {
            self.events.typing_changed(TypingEvent {
                from: from.clone(),
                group_id: state.group_id,
                is_typing: state.is_typing,
            });
        }
    }

    /// Who is typing in `conversation` right now.
    pub fn typing_in(&self, conversation: &OpenConversation) -> Vec<Address> {
        let tracker = lock(&self.typing);
        match conversation {
            OpenConversation::Peer(peer) => {
                if tracker.is_typing(peer, None, Instant::now()) {
                    vec![peer.clone()]
                } else {
                    Vec::new()
                }
            }
            OpenConversation::Group(group) => tracker.typing_in(Some(group.as_str()), Instant::now()),
        }
    }

    fn expire_typing(&self) {
        let expired = lock(&self.typing).expire(Instant::now());
        for (from, group_id) in expired {
            self.events.typing_changed(TypingEvent {
                from,
                group_id,
                is_typing: false,
            });
        }
    }
}

fn spawn_typing_expiry(coordinator: Weak<DeliveryCoordinator>, expiry: Duration) -> JoinHandle<()> {
    let period = (expiry / 5).max(Duration::from_millis(50));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let Some(coordinator) = coordinator.upgrade() else { break };
            coordinator.expire_typing();
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use parley_net::{
        MemorySignalHub, MemoryTransport, NetError, Subscribers, Subscription,
    };
    use parley_shared::protocol::{DeliveryStatus, UserInfo};

    use super::*;

    /// Relay double: knows a fixed set of keys and records what it accepts.
    struct FakeRelay {
        connected: AtomicBool,
        accept: AtomicBool,
        keys: Mutex<HashMap<Address, String>>,
        accepted: Mutex<Vec<RelayedMessage>>,
        deliveries: Subscribers<ServerFrame>,
        pushes: Subscribers<ServerFrame>,
    }

    impl FakeRelay {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                connected: AtomicBool::new(true),
                accept: AtomicBool::new(true),
                keys: Mutex::new(HashMap::new()),
                accepted: Mutex::new(Vec::new()),
                deliveries: Subscribers::unbounded(),
                pushes: Subscribers::new(16),
            })
        }

        fn accepted_ids(&self) -> Vec<String> {
            lock(&self.accepted).iter().map(|m| m.id.clone()).collect()
        }
    }

    #[async_trait]
    impl RelayApi for FakeRelay {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn register(
            &self,
            address: &Address,
            public_key: &str,
            username: Option<&str>,
        ) -> std::result::Result<RegisteredUser, NetError> {
            Ok(RegisteredUser {
                address: address.clone(),
                public_key: public_key.to_string(),
                username: username.map(str::to_string),
            })
        }

        async fn set_username(&self, _: &str) -> std::result::Result<UsernameResult, NetError> {
            Err(NetError::NotConnected)
        }

        async fn lookup_by_username(
            &self,
            _: &str,
        ) -> std::result::Result<Option<UserSummary>, NetError> {
            Ok(None)
        }

        async fn get_public_key(
            &self,
            address: &Address,
        ) -> std::result::Result<Option<PublicKeyInfo>, NetError> {
            if !self.is_connected() {
                return Err(NetError::NotConnected);
            }
            Ok(lock(&self.keys).get(address).map(|k| PublicKeyInfo {
                public_key: k.clone(),
                online: false,
            }))
        }

        async fn get_user(&self, _: &Address) -> std::result::Result<Option<UserInfo>, NetError> {
            Ok(None)
        }

        async fn check_online(&self, _: &Address) -> std::result::Result<bool, NetError> {
            Ok(false)
        }

        async fn send_message(
            &self,
            message: RelayedMessage,
        ) -> std::result::Result<DeliveryStatus, NetError> {
            if !self.accept.load(Ordering::SeqCst) {
                return Err(NetError::ChannelClosed);
            }
            lock(&self.accepted).push(message);
            Ok(DeliveryStatus::Stored)
        }

        async fn send_receipt(
            &self,
            _: &str,
            _: &Address,
            _: ReceiptKind,
        ) -> std::result::Result<(), NetError> {
            Ok(())
        }

        async fn send_signal(
            &self,
            _: &Address,
            _: SignalPayload,
        ) -> std::result::Result<(), NetError> {
            Ok(())
        }

        async fn get_history(
            &self,
            _: &Address,
        ) -> std::result::Result<Vec<RelayedMessage>, NetError> {
            Ok(lock(&self.accepted).clone())
        }

        fn subscribe_deliveries(&self) -> Subscription<ServerFrame> {
            self.deliveries.subscribe()
        }

        fn subscribe(&self) -> Subscription<ServerFrame> {
            self.pushes.subscribe()
        }
    }

    async fn coordinator(identity: Identity, relay: Arc<FakeRelay>) -> Arc<DeliveryCoordinator> {
        let hub = MemorySignalHub::new();
        let signals: Arc<dyn SignalChannel> = Arc::new(hub.channel(identity.address()));
        let connections = ConnectionManager::new(
            identity.address(),
            signals.clone(),
            Arc::new(MemoryTransport::new()),
            Default::default(),
        );
        let transports = Transports {
            relay,
            signals,
            connections,
        };
        let store = Arc::new(LocalStore::in_memory().unwrap());
        DeliveryCoordinator::new(identity, store, transports, ClientConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn unknown_key_queues_plaintext() {
        let relay = FakeRelay::new();
        let alice = coordinator(Identity::generate(), relay.clone()).await;
        let bob = Address::new("bb");

        let outcome = alice.send(&bob, "hi", None).await.unwrap();
        assert!(matches!(outcome, SendOutcome::Queued { reason: QueueReason::UnknownRecipientKey, .. }));
        assert_eq!(outcome.message().status, MessageStatus::Pending);

        let pending = alice.pending_for(&bob).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message.content, "hi");
        assert!(pending[0].message.encrypted.is_none());

        let log = alice.history("bb").await.unwrap();
        assert_eq!(log[0].status, MessageStatus::Pending);
        assert!(relay.accepted_ids().is_empty());
    }

    #[tokio::test]
    async fn flush_drains_outbox_once_keys_resolve() {
        let relay = FakeRelay::new();
        let alice = coordinator(Identity::generate(), relay.clone()).await;
        let bob = Identity::generate();
        let carol = Address::new("cc");

        let first = alice.send(&bob.address(), "one", None).await.unwrap();
        let second = alice.send(&bob.address(), "two", None).await.unwrap();
        alice.send(&carol, "three", None).await.unwrap();
        assert!(first.is_queued() && second.is_queued());

        lock(&relay.keys).insert(bob.address(), bob.public_key_b64());
        let (tx, mut rx) = mpsc::channel(8);
        let summary = alice.flush_pending_messages(Some(&tx)).await.unwrap();
        assert_eq!(summary, FlushSummary { sent: 2, failed: 1 });

        let mut expected = vec![first.message().id.clone(), second.message().id.clone()];
        expected.sort();
        let mut reported = Vec::new();
        while let Ok(update) = rx.try_recv() {
            assert_eq!(update.status, MessageStatus::Sent);
            reported.push(update.id);
        }
        reported.sort();
        assert_eq!(reported, expected);
        let mut accepted = relay.accepted_ids();
        accepted.sort();
        assert_eq!(accepted, expected);

        assert!(alice.pending_for(&bob.address()).await.unwrap().is_empty());
        assert_eq!(alice.pending_for(&carol).await.unwrap().len(), 1);
        let log = alice.history(bob.address().as_str()).await.unwrap();
        assert!(log.iter().all(|m| m.status == MessageStatus::Sent));
    }

    #[tokio::test]
    async fn relay_failure_queues_ciphertext_and_offline_flush_retains() {
        let relay = FakeRelay::new();
        let alice = coordinator(Identity::generate(), relay.clone()).await;
        let bob = Identity::generate();
        lock(&relay.keys).insert(bob.address(), bob.public_key_b64());
        relay.accept.store(false, Ordering::SeqCst);

        let outcome = alice.send(&bob.address(), "hi", None).await.unwrap();
        assert!(matches!(outcome, SendOutcome::Queued { reason: QueueReason::RelayUnreachable, .. }));
        let pending = alice.pending_for(&bob.address()).await.unwrap();
        assert!(pending[0].message.is_encrypted());

        relay.connected.store(false, Ordering::SeqCst);
        let summary = alice.flush_pending_messages(None).await.unwrap();
        assert_eq!(summary, FlushSummary { sent: 0, failed: 1 });

        relay.connected.store(true, Ordering::SeqCst);
        relay.accept.store(true, Ordering::SeqCst);
        let summary = alice.flush_pending_messages(None).await.unwrap();
        assert_eq!(summary.sent, 1);
        // The ciphertext queued earlier is reused as is.
        assert_eq!(lock(&relay.accepted)[0].encrypted, pending[0].message.encrypted.clone().unwrap());
    }

    #[tokio::test]
    async fn sent_message_is_persisted_and_echo_dropped() {
        let relay = FakeRelay::new();
        let alice_id = Identity::generate();
        let alice = coordinator(alice_id.clone(), relay.clone()).await;
        let bob = Identity::generate();
        lock(&relay.keys).insert(bob.address(), bob.public_key_b64());

        let outcome = alice.send(&bob.address(), "hi", None).await.unwrap();
        assert!(matches!(&outcome, SendOutcome::Sent(m) if m.transport == Transport::Relay));

        let echo = lock(&relay.accepted)[0].clone();
        assert!(alice.handle_incoming(echo, Transport::Relay).await.unwrap().is_none());
        assert_eq!(alice.history(bob.address().as_str()).await.unwrap().len(), 1);
        assert_eq!(alice.contacts().await[0].unread_count, 0);
    }

    #[tokio::test]
    async fn incoming_is_stored_once_and_counts_unread() {
        let relay = FakeRelay::new();
        let bob_id = Identity::generate();
        let bob = coordinator(bob_id.clone(), relay.clone()).await;
        let alice = Identity::generate();
        let mut events = bob.events().messages();

        let mut draft = Message {
            id: "m1".into(),
            from: alice.address(),
            to: bob_id.address().to_string(),
            group_id: None,
            content: "hello".into(),
            encrypted: None,
            nonce: None,
            sender_public_key: String::new(),
            timestamp: 1,
            saved_at: None,
            status: MessageStatus::Pending,
            transport: Transport::Queued,
            reply_to: None,
            decryption_failed: false,
        };
        let relayed = codec::seal(&alice, &bob_id.public_key_b64(), &mut draft, &bob_id.address()).unwrap();

        let stored = bob.handle_incoming(relayed.clone(), Transport::Relay).await.unwrap().unwrap();
        assert_eq!(stored.content, "hello");
        assert!(bob.handle_incoming(relayed, Transport::P2p).await.unwrap().is_none());

        let event = events.recv().await.unwrap();
        assert!(!event.visible);
        assert!(events.try_recv().is_none());

        let contacts = bob.contacts().await;
        assert_eq!(contacts[0].unread_count, 1);

        let history = bob
            .open_conversation(OpenConversation::Peer(alice.address()))
            .await
            .unwrap();
        assert_eq!(history[0].status, MessageStatus::Read);
        assert_eq!(bob.contacts().await[0].unread_count, 0);
    }

    #[tokio::test]
    async fn tampered_message_is_kept_with_marker() {
        let relay = FakeRelay::new();
        let bob_id = Identity::generate();
        let bob = coordinator(bob_id.clone(), relay).await;
        let alice = Identity::generate();
        let mallory = Identity::generate();

        let mut draft = Message {
            id: "m1".into(),
            from: alice.address(),
            to: bob_id.address().to_string(),
            group_id: None,
            content: "secret".into(),
            encrypted: None,
            nonce: None,
            sender_public_key: String::new(),
            timestamp: 1,
            saved_at: None,
            status: MessageStatus::Pending,
            transport: Transport::Queued,
            reply_to: None,
            decryption_failed: false,
        };
        let mut relayed = codec::seal(&alice, &bob_id.public_key_b64(), &mut draft, &bob_id.address()).unwrap();
        relayed.sender_public_key = mallory.public_key_b64();

        let stored = bob.handle_incoming(relayed, Transport::Relay).await.unwrap().unwrap();
        assert!(stored.decryption_failed);
        assert_eq!(bob.history(alice.address().as_str()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn signed_out_coordinator_cannot_flush() {
        let relay = FakeRelay::new();
        let alice = coordinator(Identity::generate(), relay).await;
        alice.sign_out();
        assert!(matches!(
            alice.flush_pending_messages(None).await,
            Err(ClientError::NoKeyMaterial(_))
        ));
        assert!(matches!(
            alice.send(&Address::new("bb"), "hi", None).await,
            Err(ClientError::NoKeyMaterial(_))
        ));
    }

    #[tokio::test]
    async fn restore_requires_stored_key_material() {
        let relay = FakeRelay::new();
        let hub = MemorySignalHub::new();
        let address = Address::new("aa");
        let signals: Arc<dyn SignalChannel> = Arc::new(hub.channel(address.clone()));
        let transports = Transports {
            relay,
            connections: ConnectionManager::new(
                address.clone(),
                signals.clone(),
                Arc::new(MemoryTransport::new()),
                Default::default(),
            ),
            signals,
        };
        let store = Arc::new(LocalStore::in_memory().unwrap());
        let result =
            DeliveryCoordinator::restore(&address, store, transports, ClientConfig::default()).await;
        assert!(matches!(result, Err(ClientError::NoKeyMaterial(_))));
    }

    #[tokio::test]
    async fn group_send_fans_out_under_one_id() {
        let relay = FakeRelay::new();
        let alice = coordinator(Identity::generate(), relay.clone()).await;
        let bob = Identity::generate();
        let carol = Address::new("cc");
        lock(&relay.keys).insert(bob.address(), bob.public_key_b64());

        alice
            .create_group("Team", vec![bob.address(), carol.clone(), alice.local().clone()])
            .await
            .unwrap();
        let outcome = alice.send_group("team", "hello all", None).await.unwrap();
        assert!(outcome.is_queued());
        assert_eq!(outcome.message().status, MessageStatus::Sent);

        let accepted = lock(&relay.accepted).clone();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].group_id.as_deref(), Some("team"));
        assert_eq!(accepted[0].id, outcome.message().id);

        let queued = alice.pending_for(&carol).await.unwrap();
        assert_eq!(queued[0].message.id, outcome.message().id);
        assert_eq!(alice.history("team").await.unwrap().len(), 1);

        assert!(matches!(
            alice.send_group("nope", "x", None).await,
            Err(ClientError::UnknownConversation(_))
        ));
    }

    #[tokio::test]
    async fn typing_indicators_reach_tracker() {
        let relay = FakeRelay::new();
        let bob = coordinator(Identity::generate(), relay).await;
        let alice = Address::new("aa");
        let mut typing = bob.events().typing();

        bob.on_typing(
            &alice,
            TypingState {
                group_id: None,
                is_typing: true,
            },
        );
        assert_eq!(bob.typing_in(&OpenConversation::Peer(alice.clone())), vec![alice.clone()]);
        assert!(typing.recv().await.unwrap().is_typing);

        bob.on_typing(
            &alice,
            TypingState {
                group_id: None,
                is_typing: false,
            },
        );
        assert!(bob.typing_in(&OpenConversation::Peer(alice)).is_empty());
        assert!(!typing.recv().await.unwrap().is_typing);
    }
}
