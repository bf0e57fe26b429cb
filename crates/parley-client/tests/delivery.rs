//! End-to-end delivery between coordinators through an in-process relay.

use std::sync::Arc;
use std::time::Duration;

use parley_client::{
    ClientConfig, ClientError, DeliveryCoordinator, FlushSummary, OpenConversation, QueueReason,
    RelayClient, RelaySignalChannel, SendOutcome, Transports,
};
use parley_net::{
    ConnectionManager, MemoryTransport, PeerState, RelayApi, SignalChannel, Subscription,
};
use parley_server::loopback;
use parley_server::{RelayLimits, RelayService};
use parley_shared::{Address, Identity, MessageStatus, Transport};
use parley_store::LocalStore;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(3);

fn config() -> ClientConfig {
    ClientConfig::default()
        .with_request_timeout(Duration::from_secs(2))
        .with_connect_timeout(Duration::from_secs(2))
        .with_typing_expiry(Duration::from_millis(300))
}

struct Device {
    coordinator: Arc<DeliveryCoordinator>,
    relay: RelayClient,
    connections: ConnectionManager,
    _tasks: Vec<JoinHandle<()>>,
}

impl Device {
    fn address(&self) -> Address {
        self.coordinator.local().clone()
    }

    /// Drop the relay connection and wait until the relay notices.
    async fn go_offline(&self, server: &RelayService) {
        self.relay.detach();
        let address = self.address();
        tokio::time::timeout(WAIT, async {
            while server.check_online(&address).await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("relay never saw the device go offline");
    }

    async fn come_back(&self, server: &Arc<RelayService>) {
        let (tx, rx) = loopback::open(server.clone());
        self.relay.attach(tx, rx);
        self.coordinator.resume(None).await.unwrap();
    }
}

fn wire(
    server: &Arc<RelayService>,
    transport: &MemoryTransport,
    address: &Address,
    config: &ClientConfig,
) -> (Transports, RelayClient, JoinHandle<()>) {
    let relay = RelayClient::new(config);
    let (tx, rx) = loopback::open(server.clone());
    relay.attach(tx, rx);

    let relay_api: Arc<dyn RelayApi> = Arc::new(relay.clone());
    let signals: Arc<dyn SignalChannel> = RelaySignalChannel::spawn(relay_api.clone());
    let connections = ConnectionManager::new(
        address.clone(),
        signals.clone(),
        Arc::new(transport.clone()),
        config.connection(),
    );
    let negotiation = connections.start();
    let transports = Transports {
        relay: relay_api,
        signals,
        connections,
    };
    (transports, relay, negotiation)
}

async fn device(
    server: &Arc<RelayService>,
    transport: &MemoryTransport,
    identity: Identity,
    store: Arc<LocalStore>,
    start: bool,
) -> Device {
    device_with(server, transport, identity, store, start, config()).await
}

async fn device_with(
    server: &Arc<RelayService>,
    transport: &MemoryTransport,
    identity: Identity,
    store: Arc<LocalStore>,
    start: bool,
    config: ClientConfig,
) -> Device {
    let (transports, relay, negotiation) = wire(server, transport, &identity.address(), &config);
    let connections = transports.connections.clone();
    let coordinator = DeliveryCoordinator::new(identity, store, transports, config)
        .await
        .unwrap();

    let mut tasks = vec![negotiation];
    if start {
        tasks.extend(coordinator.start());
    }
    Device {
        coordinator,
        relay,
        connections,
        _tasks: tasks,
    }
}

fn memory_store() -> Arc<LocalStore> {
    Arc::new(LocalStore::in_memory().unwrap())
}

fn relay() -> Arc<RelayService> {
    Arc::new(RelayService::new(RelayLimits::default()))
}

async fn next<T>(subscription: &mut Subscription<T>) -> T {
    tokio::time::timeout(WAIT, subscription.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

#[tokio::test]
async fn queued_message_reaches_recipient_after_flush() {
    let server = relay();
    let transport = MemoryTransport::new();
    let alice = device(&server, &transport, Identity::generate(), memory_store(), true).await;
    alice.coordinator.resume(None).await.unwrap();

    // Bob has never registered, so his key is unknown.
    let bob_identity = Identity::generate();
    let bob_address = bob_identity.address();
    let outcome = alice.coordinator.send(&bob_address, "hi", None).await.unwrap();
    assert!(matches!(
        outcome,
        SendOutcome::Queued {
            reason: QueueReason::UnknownRecipientKey,
            ..
        }
    ));
    assert_eq!(alice.coordinator.pending_for(&bob_address).await.unwrap().len(), 1);

    let bob = device(&server, &transport, bob_identity, memory_store(), true).await;
    let mut inbox = bob.coordinator.events().messages();
    bob.coordinator.resume(None).await.unwrap();

    let summary = alice.coordinator.flush_pending_messages(None).await.unwrap();
    assert_eq!(summary, FlushSummary { sent: 1, failed: 0 });
    assert!(alice.coordinator.pending_for(&bob_address).await.unwrap().is_empty());

    let event = next(&mut inbox).await;
    assert_eq!(event.message.content, "hi");
    assert_eq!(event.message.from, alice.address());
    assert!(!event.message.decryption_failed);

    let history = bob.coordinator.history(alice.address().as_str()).await.unwrap();
    assert_eq!(history.len(), 1);
    let sent = alice.coordinator.history(bob_address.as_str()).await.unwrap();
    assert_eq!(sent.len(), 1);
    assert_ne!(sent[0].status, MessageStatus::Pending);
}

#[tokio::test]
async fn buffered_burst_larger_than_event_capacity_is_fully_stored() {
    const BURST: usize = 120;
    let server = relay();
    let transport = MemoryTransport::new();
    transport.set_refuse_dials(true);
    let alice = device(&server, &transport, Identity::generate(), memory_store(), true).await;
    let small_buffers = ClientConfig {
        event_capacity: 4,
        ..config()
    };
    let bob = device_with(
        &server,
        &transport,
        Identity::generate(),
        memory_store(),
        true,
        small_buffers,
    )
    .await;
    alice.coordinator.resume(None).await.unwrap();
    bob.coordinator.resume(None).await.unwrap();

    bob.go_offline(&server).await;
    for n in 0..BURST {
        let outcome = alice
            .coordinator
            .send(&bob.address(), &format!("burst {n}"), None)
            .await
            .unwrap();
        assert!(matches!(&outcome, SendOutcome::Sent(m) if m.transport == Transport::Relay));
    }
    assert_eq!(server.buffered_for(&bob.address()).await, BURST);

    bob.come_back(&server).await;
    let from = alice.address();
    let stored = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let history = bob.coordinator.history(from.as_str()).await.unwrap();
            if history.len() >= BURST {
                return history.len();
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("burst was not fully stored");
    assert_eq!(stored, BURST);
    assert_eq!(server.buffered_for(&bob.address()).await, 0);
}

#[tokio::test]
async fn relay_buffers_for_offline_peer_and_receipt_comes_back() {
    let server = relay();
    let transport = MemoryTransport::new();
    let alice = device(&server, &transport, Identity::generate(), memory_store(), true).await;
    let bob = device(&server, &transport, Identity::generate(), memory_store(), true).await;
    alice.coordinator.resume(None).await.unwrap();
    bob.coordinator.resume(None).await.unwrap();

    bob.go_offline(&server).await;
    let mut receipts = alice.coordinator.events().receipts();
    let outcome = alice
        .coordinator
        .send(&bob.address(), "while you were out", None)
        .await
        .unwrap();
    assert!(matches!(&outcome, SendOutcome::Sent(m) if m.transport == Transport::Relay));
    assert_eq!(server.buffered_for(&bob.address()).await, 1);

    let mut inbox = bob.coordinator.events().messages();
    bob.come_back(&server).await;

    let event = next(&mut inbox).await;
    assert_eq!(event.message.content, "while you were out");

    let receipt = next(&mut receipts).await;
    assert_eq!(receipt.message_id, outcome.message().id);
    assert_eq!(receipt.from, bob.address());
    assert!(matches!(receipt.status, MessageStatus::Delivered | MessageStatus::Read));

    // Delivered once even if both the buffer drain and history merge saw it.
    let history = bob.coordinator.history(alice.address().as_str()).await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn reconcile_counts_unread_until_conversation_is_opened() {
    let server = relay();
    let transport = MemoryTransport::new();
    // Keep every message on the relay so it shows up in history.
    transport.set_refuse_dials(true);
    let alice = device(&server, &transport, Identity::generate(), memory_store(), true).await;
    alice.coordinator.resume(Some("alice")).await.unwrap();

    // Bob runs no pumps, so only reconciliation brings messages in.
    let bob = device(&server, &transport, Identity::generate(), memory_store(), false).await;
    bob.coordinator.resume(None).await.unwrap();
    let found = bob
        .coordinator
        .add_contact_by_username("Alice")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.address, alice.address());

    alice.coordinator.send(&bob.address(), "one", None).await.unwrap();
    alice.coordinator.send(&bob.address(), "two", None).await.unwrap();

    assert_eq!(bob.coordinator.reconcile().await.unwrap(), 2);
    assert_eq!(bob.coordinator.reconcile().await.unwrap(), 0);

    let contacts = bob.coordinator.contacts().await;
    let contact = contacts
        .iter()
        .find(|c| c.address == alice.address().as_str())
        .unwrap();
    assert_eq!(contact.unread_count, 2);
    assert_eq!(contact.username.as_deref(), Some("alice"));

    let history = bob
        .coordinator
        .open_conversation(OpenConversation::Peer(alice.address()))
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|m| m.status == MessageStatus::Read));
    assert!(bob.coordinator.contacts().await.iter().all(|c| c.unread_count == 0));
}

#[tokio::test]
async fn direct_link_carries_messages_and_receipts() {
    let server = relay();
    let transport = MemoryTransport::new();
    let alice = device(&server, &transport, Identity::generate(), memory_store(), true).await;
    let bob = device(&server, &transport, Identity::generate(), memory_store(), true).await;
    alice.coordinator.resume(None).await.unwrap();
    bob.coordinator.resume(None).await.unwrap();

    alice
        .coordinator
        .open_conversation(OpenConversation::Peer(bob.address()))
        .await
        .unwrap();
    tokio::time::timeout(WAIT, async {
        while alice.connections.state(&bob.address()) != PeerState::Connected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("direct link never came up");

    let mut inbox = bob.coordinator.events().messages();
    let mut receipts = alice.coordinator.events().receipts();
    let outcome = alice.coordinator.send(&bob.address(), "direct", None).await.unwrap();
    assert!(matches!(&outcome, SendOutcome::Sent(m) if m.transport == Transport::P2p));

    let event = next(&mut inbox).await;
    assert_eq!(event.message.content, "direct");
    assert_eq!(event.message.transport, Transport::P2p);

    let receipt = next(&mut receipts).await;
    assert_eq!(receipt.message_id, outcome.message().id);
    assert_eq!(receipt.status, MessageStatus::Delivered);
}

#[tokio::test]
async fn typing_indicator_crosses_relay_and_expires() {
    let server = relay();
    let transport = MemoryTransport::new();
    let alice = device(&server, &transport, Identity::generate(), memory_store(), true).await;
    let bob = device(&server, &transport, Identity::generate(), memory_store(), true).await;
    alice.coordinator.resume(None).await.unwrap();
    bob.coordinator.resume(None).await.unwrap();

    let mut typing = bob.coordinator.events().typing();
    alice
        .coordinator
        .send_typing(&OpenConversation::Peer(bob.address()), true)
        .await
        .unwrap();

    let started = next(&mut typing).await;
    assert_eq!(started.from, alice.address());
    assert!(started.is_typing);
    assert_eq!(
        bob.coordinator.typing_in(&OpenConversation::Peer(alice.address())),
        vec![alice.address()]
    );

    // No stop was sent; the indicator lapses on its own.
    let stopped = next(&mut typing).await;
    assert!(!stopped.is_typing);
    assert!(bob
        .coordinator
        .typing_in(&OpenConversation::Peer(alice.address()))
        .is_empty());
}

#[tokio::test]
async fn restart_restores_identity_and_outbox() {
    let server = relay();
    let transport = MemoryTransport::new();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("parley.db");
    let identity = Identity::generate();
    let address = identity.address();
    let carol = Address::new("cc");

    {
        let store = Arc::new(LocalStore::open(&path).unwrap());
        let first = device(&server, &transport, identity.clone(), store, false).await;
        let outcome = first.coordinator.send(&carol, "later", None).await.unwrap();
        assert!(outcome.is_queued());
    }

    let store = Arc::new(LocalStore::open(&path).unwrap());
    let (transports, _relay, _negotiation) = wire(&server, &transport, &address, &config());
    let restored = DeliveryCoordinator::restore(&address, store.clone(), transports, config())
        .await
        .unwrap();
    assert_eq!(restored.local(), &address);
    assert_eq!(restored.pending_for(&carol).await.unwrap().len(), 1);
    assert!(restored.contacts().await.iter().any(|c| c.address == "cc"));

    let resumed = restored.resume(None).await.unwrap();
    assert_eq!(resumed.registered.public_key, identity.public_key_b64());
    assert_eq!(resumed.flushed, FlushSummary { sent: 0, failed: 1 });

    let (transports, _relay, _negotiation) = wire(&server, &transport, &Address::new("ff"), &config());
    let unknown =
        DeliveryCoordinator::restore(&Address::new("ff"), store, transports, config()).await;
    assert!(matches!(unknown, Err(ClientError::NoKeyMaterial(_))));
}
