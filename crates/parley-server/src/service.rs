//! Relay state and operations.
//!
//! [`RelayService`] owns three independently locked stores:
//!
//! - the **directory**: presence per address, the username map and which
//!   connection is bound to which address,
//! - **histories**: the last `history_limit` messages per conversation,
//! - the **offline buffer**: messages waiting for a recipient to register.
//!
//! When both are needed, the offline buffer is locked before the directory.
//! This makes "recipient online?" and "buffer or deliver" one atomic step
//! with respect to registration, so a message is never buffered after its
//! recipient has drained the buffer.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parley_shared::constants::{USERNAME_MAX_LEN, USERNAME_MIN_LEN};
use parley_shared::protocol::{
    DeliveryStatus, PresenceUpdate, PublicKeyResponse, ReceiptNotice, ReceiptRequest,
    RegisterRequest, RegisteredUser, RelayedMessage, ServerFrame, ServerResponse, SignalNotice,
    SignalPayload, UserInfo, UserSummary,
};
use parley_shared::types::{canonical_pair, now_ms};
use parley_shared::{Address, MessageStatus};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{ServerError, UsernameError};

pub type ConnId = u64;

/// One client connection's outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnId,
    tx: mpsc::UnboundedSender<ServerResponse>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Queue a frame; `false` once the connection is gone.
    pub fn send(&self, response: ServerResponse) -> bool {
        self.tx.send(response).is_ok()
    }

    pub fn push(&self, frame: ServerFrame) -> bool {
        self.send(ServerResponse::push(frame))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RelayLimits {
    pub history: usize,
    pub offline_buffer: usize,
}

impl Default for RelayLimits {
    fn default() -> Self {
        let config = ServerConfig::default();
        Self::from(&config)
    }
}

impl From<&ServerConfig> for RelayLimits {
    fn from(config: &ServerConfig) -> Self {
        Self {
            history: config.history_limit,
            offline_buffer: config.offline_buffer_limit,
        }
    }
}

#[derive(Debug)]
struct Presence {
    handle: Option<ConnectionHandle>,
    public_key: String,
    online: bool,
    last_seen: i64,
    username: Option<String>,
}

#[derive(Debug, Default)]
struct Directory {
    presence: HashMap<Address, Presence>,
    usernames: HashMap<String, Address>,
    bindings: HashMap<ConnId, Address>,
}

impl Directory {
    fn online_handle(&self, address: &Address) -> Option<&ConnectionHandle> {
        self.presence
            .get(address)
            .filter(|p| p.online)
            .and_then(|p| p.handle.as_ref())
    }

    fn broadcast_presence(&self, subject: &Address, online: bool, last_seen: i64) {
        let update = PresenceUpdate {
            address: subject.clone(),
            online,
            last_seen,
        };
        for (address, presence) in &self.presence {
            if address == subject || !presence.online {
                continue;
            }
            if let Some(handle) = &presence.handle {
                handle.push(ServerFrame::UserStatus(update.clone()));
            }
        }
    }

    fn assign_username(&mut self, address: &Address, requested: &str) -> Result<String, UsernameError> {
        let username = validate_username(requested)?;
        if let Some(owner) = self.usernames.get(&username) {
            if owner != address {
                return Err(UsernameError::Taken);
            }
        }
        let presence = self
            .presence
            .get_mut(address)
            .ok_or(UsernameError::NotRegistered)?;
        if let Some(previous) = presence.username.replace(username.clone()) {
            if previous != username {
                self.usernames.remove(&previous);
            }
        }
        self.usernames.insert(username.clone(), address.clone());
        Ok(username)
    }

    // Clears `conn`'s binding. Marks its address offline only if `conn` is
    // still the handle registered for it.
    fn release(&mut self, conn: ConnId) -> Option<(Address, i64)> {
        let address = self.bindings.remove(&conn)?;
        let presence = self.presence.get_mut(&address)?;
        if presence.handle.as_ref().map(|h| h.id) != Some(conn) {
            debug!(conn, address = %address.short(), "stale connection closed");
            return None;
        }
        presence.online = false;
        presence.handle = None;
        presence.last_seen = now_ms();
        Some((address, presence.last_seen))
    }
}

#[derive(Debug)]
struct Buffered {
    message: RelayedMessage,
    buffered_at: i64,
}

/// Lowercase and validate a requested username.
fn check_address(address: &Address) -> Result<(), ServerError> {
    if address.is_well_formed() {
        Ok(())
    } else {
        Err(ServerError::InvalidAddress(address.to_string()))
    }
}

pub fn validate_username(requested: &str) -> Result<String, UsernameError> {
    let username = requested.trim().to_lowercase();
    let len = username.chars().count();
    if len < USERNAME_MIN_LEN {
        return Err(UsernameError::TooShort(USERNAME_MIN_LEN));
    }
    if len > USERNAME_MAX_LEN {
        return Err(UsernameError::TooLong(USERNAME_MAX_LEN));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(UsernameError::InvalidCharacters);
    }
    Ok(username)
}

pub struct RelayService {
    limits: RelayLimits,
    next_conn: AtomicU64,
    directory: RwLock<Directory>,
    histories: Mutex<HashMap<String, VecDeque<RelayedMessage>>>,
    offline: Mutex<HashMap<Address, VecDeque<Buffered>>>,
}

impl RelayService {
    pub fn new(limits: RelayLimits) -> Self {
        Self {
            limits,
            next_conn: AtomicU64::new(1),
            directory: RwLock::new(Directory::default()),
            histories: Mutex::new(HashMap::new()),
            offline: Mutex::new(HashMap::new()),
        }
    }

    /// Open a connection. Frames for it arrive on the returned receiver.
    pub fn connect(&self) -> (ConnectionHandle, mpsc::UnboundedReceiver<ServerResponse>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        debug!(conn = id, "connection opened");
        (ConnectionHandle { id, tx }, rx)
    }

    /// Address bound to `conn`, if it registered.
    pub async fn address_of(&self, conn: &ConnectionHandle) -> Option<Address> {
        self.directory.read().await.bindings.get(&conn.id).cloned()
    }

    async fn require_address(&self, conn: &ConnectionHandle) -> Result<Address, ServerError> {
        self.address_of(conn).await.ok_or(ServerError::NotRegistered)
    }

    // -- presence ------------------------------------------------------------

    /// Bind `conn` to an address, deliver what was buffered for it and tell
    /// everyone else it is online.
    pub async fn register(
        &self,
        conn: &ConnectionHandle,
        request: RegisterRequest,
    ) -> Result<RegisteredUser, ServerError> {
        let RegisterRequest {
            address,
            public_key,
            username,
        } = request;
        check_address(&address)?;

        let mut offline = self.offline.lock().await;
        let mut directory = self.directory.write().await;

        if let Some(previous) = directory.bindings.get(&conn.id).cloned() {
            if previous != address {
                if let Some((old, last_seen)) = directory.release(conn.id) {
                    directory.broadcast_presence(&old, false, last_seen);
                }
            }
        }

        let now = now_ms();
        let Directory {
            presence, bindings, ..
        } = &mut *directory;
        let entry = presence.entry(address.clone()).or_insert_with(|| Presence {
            handle: None,
            public_key: public_key.clone(),
            online: false,
            last_seen: now,
            username: None,
        });
        if let Some(replaced) = entry.handle.replace(conn.clone()) {
            if replaced.id != conn.id {
                debug!(address = %address.short(), old = replaced.id, new = conn.id, "registration moved to new connection");
                bindings.remove(&replaced.id);
            }
        }
        entry.public_key = public_key.clone();
        entry.online = true;
        entry.last_seen = now;
        bindings.insert(conn.id, address.clone());

        if let Some(requested) = username.as_deref() {
            if let Err(e) = directory.assign_username(&address, requested) {
                warn!(address = %address.short(), error = %e, "username from register ignored");
            }
        }

        if let Some(buffered) = offline.remove(&address) {
            info!(address = %address.short(), count = buffered.len(), "delivering buffered messages");
            for entry in buffered {
                conn.push(ServerFrame::Message(entry.message));
            }
        }
        drop(offline);

        directory.broadcast_presence(&address, true, now);
        info!(address = %address.short(), conn = conn.id, "registered");

        Ok(RegisteredUser {
            address: address.clone(),
            public_key,
            username: directory
                .presence
                .get(&address)
                .and_then(|p| p.username.clone()),
        })
    }

    /// Mark the connection closed. Only the handle currently registered for
    /// an address can take that address offline.
    pub async fn disconnect(&self, conn: &ConnectionHandle) {
        let mut directory = self.directory.write().await;
        if let Some((address, last_seen)) = directory.release(conn.id) {
            directory.broadcast_presence(&address, false, last_seen);
            info!(address = %address.short(), conn = conn.id, "went offline");
        }
    }

    pub async fn set_username(
        &self,
        conn: &ConnectionHandle,
        requested: &str,
    ) -> Result<String, UsernameError> {
        let mut directory = self.directory.write().await;
        let address = directory
            .bindings
            .get(&conn.id)
            .cloned()
            .ok_or(UsernameError::NotRegistered)?;
        let username = directory.assign_username(&address, requested)?;
        info!(address = %address.short(), %username, "username set");
        Ok(username)
    }

    pub async fn lookup_by_username(&self, username: &str) -> Option<UserSummary> {
        let directory = self.directory.read().await;
        let username = username.trim().to_lowercase();
        let address = directory.usernames.get(&username)?;
        let presence = directory.presence.get(address)?;
        Some(UserSummary {
            address: address.clone(),
            username,
            public_key: presence.public_key.clone(),
            online: presence.online,
        })
    }

    pub async fn get_public_key(&self, address: &Address) -> PublicKeyResponse {
        let directory = self.directory.read().await;
        let presence = directory.presence.get(address);
        PublicKeyResponse {
            address: address.clone(),
            public_key: presence.map(|p| p.public_key.clone()),
            online: presence.is_some_and(|p| p.online),
        }
    }

    pub async fn get_user(&self, address: &Address) -> Option<UserInfo> {
        let directory = self.directory.read().await;
        directory.presence.get(address).map(|p| UserInfo {
            address: address.clone(),
            public_key: p.public_key.clone(),
            online: p.online,
            last_seen: p.last_seen,
            username: p.username.clone(),
        })
    }

    pub async fn check_online(&self, address: &Address) -> bool {
        self.directory
            .read()
            .await
            .presence
            .get(address)
            .is_some_and(|p| p.online)
    }

    pub async fn online_count(&self) -> usize {
        self.directory
            .read()
            .await
            .presence
            .values()
            .filter(|p| p.online)
            .count()
    }

    // -- messages ------------------------------------------------------------

    /// Store `message` in the conversation history and deliver it now or
    /// when the recipient next registers. Returns the message as relayed.
    pub async fn relay_message(
        &self,
        conn: &ConnectionHandle,
        mut message: RelayedMessage,
    ) -> Result<(DeliveryStatus, RelayedMessage), ServerError> {
        let from = self.require_address(conn).await?;
        check_address(&message.to)?;
        message.from = Some(from.clone());
        message.status = Some(MessageStatus::Sent);
        if message.sender_username.is_none() {
            message.sender_username = self
                .directory
                .read()
                .await
                .presence
                .get(&from)
                .and_then(|p| p.username.clone());
        }

        self.append_history(&canonical_pair(&from, &message.to), &message)
            .await;

        let mut offline = self.offline.lock().await;
        let directory = self.directory.read().await;

        let status = match directory.online_handle(&message.to) {
            Some(handle) if handle.push(ServerFrame::Message(message.clone())) => {
                DeliveryStatus::Delivered
            }
            _ => {
                let queue = offline.entry(message.to.clone()).or_default();
                if !queue.iter().any(|b| b.message.id == message.id) {
                    queue.push_back(Buffered {
                        message: message.clone(),
                        buffered_at: now_ms(),
                    });
                    while queue.len() > self.limits.offline_buffer {
                        if let Some(dropped) = queue.pop_front() {
                            warn!(to = %message.to.short(), id = %dropped.message.id, "offline buffer full, dropping oldest");
                        }
                    }
                }
                DeliveryStatus::Stored
            }
        };

        debug!(id = %message.id, from = %from.short(), to = %message.to.short(), ?status, "relayed");
        Ok((status, message))
    }

    async fn append_history(&self, conversation: &str, message: &RelayedMessage) {
        let mut histories = self.histories.lock().await;
        let history = histories.entry(conversation.to_string()).or_default();
        if history.iter().any(|m| m.id == message.id) {
            return;
        }
        history.push_back(message.clone());
        while history.len() > self.limits.history {
            history.pop_front();
        }
    }

    /// Apply a delivered/read receipt and forward it to the original sender.
    /// Returns `false` for an unknown message id.
    pub async fn relay_receipt(
        &self,
        conn: &ConnectionHandle,
        receipt: ReceiptRequest,
    ) -> Result<bool, ServerError> {
        let from = self.require_address(conn).await?;
        let conversation = canonical_pair(&from, &receipt.to);

        let original_sender = {
            let mut histories = self.histories.lock().await;
            histories
                .get_mut(&conversation)
                .and_then(|h| h.iter_mut().find(|m| m.id == receipt.message_id))
                .map(|m| {
                    m.status = Some(receipt.receipt_type.into());
                    m.from.clone()
                })
        };
        let Some(original_sender) = original_sender.flatten() else {
            debug!(id = %receipt.message_id, "receipt for unknown message ignored");
            return Ok(false);
        };

        let directory = self.directory.read().await;
        if let Some(handle) = directory.online_handle(&original_sender) {
            handle.push(ServerFrame::MessageReceipt(ReceiptNotice {
                message_id: receipt.message_id,
                receipt_type: receipt.receipt_type,
                from,
            }));
        }
        Ok(true)
    }

    /// Forward a signal if the target is connected. Returns whether it was.
    pub async fn relay_signal(
        &self,
        conn: &ConnectionHandle,
        to: &Address,
        signal: SignalPayload,
    ) -> Result<bool, ServerError> {
        let from = self.require_address(conn).await?;
        let directory = self.directory.read().await;
        let forwarded = directory
            .online_handle(to)
            .is_some_and(|handle| handle.push(ServerFrame::Signal(SignalNotice { from, signal })));
        Ok(forwarded)
    }

    /// Conversation between the caller and `peer`, oldest first.
    pub async fn get_history(
        &self,
        conn: &ConnectionHandle,
        peer: &Address,
    ) -> Result<Vec<RelayedMessage>, ServerError> {
        let me = self.require_address(conn).await?;
        let mut messages: Vec<RelayedMessage> = {
            let histories = self.histories.lock().await;
            histories
                .get(&canonical_pair(&me, peer))
                .map(|h| h.iter().cloned().collect())
                .unwrap_or_default()
        };

        let directory = self.directory.read().await;
        for message in &mut messages {
            if message.sender_username.is_some() {
                continue;
            }
            message.sender_username = message
                .from
                .as_ref()
                .and_then(|from| directory.presence.get(from))
                .and_then(|p| p.username.clone());
        }
        Ok(messages)
    }

    /// Drop buffered messages older than `max_age_ms`.
    pub async fn purge_expired_buffers(&self, max_age_ms: i64) -> usize {
        let cutoff = now_ms() - max_age_ms;
        let mut offline = self.offline.lock().await;
        let mut purged = 0;
        offline.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|b| b.buffered_at >= cutoff);
            purged += before - queue.len();
            !queue.is_empty()
        });
        if purged > 0 {
            info!(purged, "expired buffered messages");
        }
        purged
    }

    pub async fn buffered_for(&self, address: &Address) -> usize {
        self.offline
            .lock()
            .await
            .get(address)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use parley_shared::protocol::{ReceiptKind, TypingState};

    use super::*;

    fn service() -> RelayService {
        RelayService::new(RelayLimits {
            history: 3,
            offline_buffer: 2,
        })
    }

    async fn register(
        relay: &RelayService,
        address: &str,
    ) -> (ConnectionHandle, mpsc::UnboundedReceiver<ServerResponse>) {
        let (conn, rx) = relay.connect();
        relay
            .register(
                &conn,
                RegisterRequest {
                    address: Address::new(address),
                    public_key: format!("pk-{address}"),
                    username: None,
                },
            )
            .await
            .unwrap();
        (conn, rx)
    }

    fn message(id: &str, to: &str) -> RelayedMessage {
        RelayedMessage {
            id: id.into(),
            from: None,
            to: Address::new(to),
            encrypted: "ct".into(),
            nonce: "n".into(),
            sender_public_key: "pk".into(),
            timestamp: 1,
            group_id: None,
            status: None,
            sender_username: None,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerResponse>) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(response) = rx.try_recv() {
            frames.push(response.frame);
        }
        frames
    }

    #[tokio::test]
    async fn store_and_forward() {
        let relay = service();
        let (alice, _alice_rx) = register(&relay, "aa").await;

        let (status, stamped) = relay.relay_message(&alice, message("m1", "bb")).await.unwrap();
        assert_eq!(status, DeliveryStatus::Stored);
        assert_eq!(stamped.from, Some(Address::new("aa")));
        assert_eq!(relay.buffered_for(&Address::new("bb")).await, 1);

        let (_bob, mut bob_rx) = register(&relay, "bb").await;
        let frames = drain(&mut bob_rx);
        assert!(matches!(&frames[0], ServerFrame::Message(m) if m.id == "m1"));
        assert_eq!(relay.buffered_for(&Address::new("bb")).await, 0);

        let (status, _) = relay.relay_message(&alice, message("m2", "bb")).await.unwrap();
        assert_eq!(status, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn malformed_addresses_leave_buffers_alone() {
        let relay = service();
        let (alice, _a) = register(&relay, "aa").await;
        relay.relay_message(&alice, message("m1", "bb")).await.unwrap();

        let result = relay.relay_message(&alice, message("m2", "bbbbbbbé")).await;
        assert!(matches!(result, Err(ServerError::InvalidAddress(_))));

        let (conn, _rx) = relay.connect();
        let result = relay
            .register(
                &conn,
                RegisterRequest {
                    address: Address::new("not-hex"),
                    public_key: "pk".into(),
                    username: None,
                },
            )
            .await;
        assert!(matches!(result, Err(ServerError::InvalidAddress(_))));
        assert!(relay.address_of(&conn).await.is_none());
        assert_eq!(relay.buffered_for(&Address::new("bb")).await, 1);
        assert_eq!(relay.buffered_for(&Address::new("bbbbbbbé")).await, 0);
    }

    #[tokio::test]
    async fn offline_buffer_drops_oldest() {
        let relay = service();
        let (alice, _rx) = register(&relay, "aa").await;
        for id in ["m1", "m2", "m3"] {
            relay.relay_message(&alice, message(id, "bb")).await.unwrap();
        }
        // A retried id is buffered once.
        relay.relay_message(&alice, message("m3", "bb")).await.unwrap();

        let (_bob, mut bob_rx) = register(&relay, "bb").await;
        let ids: Vec<_> = drain(&mut bob_rx)
            .into_iter()
            .filter_map(|f| match f {
                ServerFrame::Message(m) => Some(m.id),
                _ => None,
            })
            .collect();
        assert_eq!(ids, ["m2", "m3"]);
    }

    #[tokio::test]
    async fn stale_socket_cannot_mark_offline() {
        let relay = service();
        let (old, _old_rx) = register(&relay, "aa").await;
        let (new, _new_rx) = register(&relay, "aa").await;
        let address = Address::new("aa");

        relay.disconnect(&old).await;
        assert!(relay.check_online(&address).await);

        relay.disconnect(&new).await;
        assert!(!relay.check_online(&address).await);
    }

    #[tokio::test]
    async fn presence_is_broadcast_to_others() {
        let relay = service();
        let (_alice, mut alice_rx) = register(&relay, "aa").await;
        let (bob, mut bob_rx) = register(&relay, "bb").await;

        let frames = drain(&mut alice_rx);
        assert!(frames.iter().any(|f| matches!(f,
            ServerFrame::UserStatus(u) if u.address == Address::new("bb") && u.online)));
        assert!(drain(&mut bob_rx)
            .iter()
            .all(|f| !matches!(f, ServerFrame::UserStatus(_))));

        relay.disconnect(&bob).await;
        let frames = drain(&mut alice_rx);
        assert!(frames.iter().any(|f| matches!(f,
            ServerFrame::UserStatus(u) if u.address == Address::new("bb") && !u.online)));
    }

    #[tokio::test]
    async fn username_scenario() {
        let relay = service();
        let (alice, _a) = register(&relay, "aa").await;
        let (bob, _b) = register(&relay, "bb").await;

        assert_eq!(relay.set_username(&alice, "Alice").await.unwrap(), "alice");
        assert_eq!(relay.set_username(&bob, "ALICE").await, Err(UsernameError::Taken));
        assert_eq!(relay.set_username(&bob, "b!").await, Err(UsernameError::TooShort(3)));
        assert_eq!(
            relay.set_username(&bob, "bad-name").await,
            Err(UsernameError::InvalidCharacters)
        );
        assert_eq!(
            relay.set_username(&bob, &"x".repeat(21)).await,
            Err(UsernameError::TooLong(20))
        );

        // Renaming releases the old name atomically.
        relay.set_username(&alice, "alice2").await.unwrap();
        assert!(relay.lookup_by_username("alice").await.is_none());
        assert_eq!(relay.set_username(&bob, "alice").await.unwrap(), "alice");

        let found = relay.lookup_by_username("ALICE").await.unwrap();
        assert_eq!(found.address, Address::new("bb"));
        assert_eq!(found.public_key, "pk-bb");

        let (unregistered, _u) = relay.connect();
        assert_eq!(
            relay.set_username(&unregistered, "carol").await,
            Err(UsernameError::NotRegistered)
        );
    }

    #[tokio::test]
    async fn reregistration_keeps_username() {
        let relay = service();
        let (alice, _a) = register(&relay, "aa").await;
        relay.set_username(&alice, "alice").await.unwrap();
        relay.disconnect(&alice).await;

        let (again, _b) = relay.connect();
        let registered = relay
            .register(
                &again,
                RegisterRequest {
                    address: Address::new("aa"),
                    public_key: "pk-new".into(),
                    username: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(registered.username.as_deref(), Some("alice"));
        let key = relay.get_public_key(&Address::new("aa")).await;
        assert_eq!(key.public_key.as_deref(), Some("pk-new"));
        assert!(key.online);
    }

    #[tokio::test]
    async fn history_is_pair_keyed_capped_and_enriched() {
        let relay = service();
        let (alice, _a) = register(&relay, "aa").await;
        let (bob, _b) = register(&relay, "bb").await;
        relay.set_username(&alice, "alice").await.unwrap();

        for id in ["m1", "m2", "m3", "m4"] {
            relay.relay_message(&alice, message(id, "bb")).await.unwrap();
        }
        relay.relay_message(&alice, message("m4", "bb")).await.unwrap();

        let history = relay.get_history(&bob, &Address::new("aa")).await.unwrap();
        let ids: Vec<_> = history.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m2", "m3", "m4"]);
        assert!(history
            .iter()
            .all(|m| m.sender_username.as_deref() == Some("alice")));

        assert_eq!(
            relay.get_history(&alice, &Address::new("bb")).await.unwrap().len(),
            3
        );
    }

    #[tokio::test]
    async fn receipts_update_status_and_forward() {
        let relay = service();
        let (alice, mut alice_rx) = register(&relay, "aa").await;
        let (bob, _b) = register(&relay, "bb").await;
        relay.relay_message(&alice, message("m1", "bb")).await.unwrap();
        drain(&mut alice_rx);

        let read = ReceiptRequest {
            message_id: "m1".into(),
            to: Address::new("aa"),
            receipt_type: ReceiptKind::Read,
        };
        assert!(relay.relay_receipt(&bob, read).await.unwrap());
        let frames = drain(&mut alice_rx);
        assert!(matches!(&frames[..], [ServerFrame::MessageReceipt(r)]
            if r.message_id == "m1" && r.from == Address::new("bb")));

        let history = relay.get_history(&alice, &Address::new("bb")).await.unwrap();
        assert_eq!(history[0].status, Some(MessageStatus::Read));

        let unknown = ReceiptRequest {
            message_id: "nope".into(),
            to: Address::new("aa"),
            receipt_type: ReceiptKind::Delivered,
        };
        assert!(!relay.relay_receipt(&bob, unknown).await.unwrap());
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn signals_only_reach_connected_peers() {
        let relay = service();
        let (alice, _a) = register(&relay, "aa").await;
        let typing = SignalPayload::Typing(TypingState {
            group_id: None,
            is_typing: true,
        });
        assert!(!relay
            .relay_signal(&alice, &Address::new("bb"), typing.clone())
            .await
            .unwrap());

        let (_bob, mut bob_rx) = register(&relay, "bb").await;
        drain(&mut bob_rx);
        assert!(relay
            .relay_signal(&alice, &Address::new("bb"), typing)
            .await
            .unwrap());
        assert!(matches!(&drain(&mut bob_rx)[..], [ServerFrame::Signal(s)] if s.from == Address::new("aa")));
    }

    #[tokio::test]
    async fn unregistered_connection_is_rejected() {
        let relay = service();
        let (conn, _rx) = relay.connect();
        assert!(matches!(
            relay.relay_message(&conn, message("m1", "bb")).await,
            Err(ServerError::NotRegistered)
        ));
        assert!(relay.get_user(&Address::new("bb")).await.is_none());
        assert!(relay.get_public_key(&Address::new("bb")).await.public_key.is_none());
    }

    #[tokio::test]
    async fn expired_buffers_are_purged() {
        let relay = service();
        let (alice, _a) = register(&relay, "aa").await;
        relay.relay_message(&alice, message("m1", "bb")).await.unwrap();
        assert_eq!(relay.purge_expired_buffers(60_000).await, 0);
        assert_eq!(relay.purge_expired_buffers(-1).await, 1);
        assert_eq!(relay.buffered_for(&Address::new("bb")).await, 0);
    }
}
