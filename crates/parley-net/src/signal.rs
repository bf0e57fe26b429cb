//! Signal channels.
//!
//! A [`SignalChannel`] carries small [`SignalPayload`]s between two
//! addresses: direct-session negotiation and typing indicators. Delivery is
//! best effort; a payload for an unreachable peer is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use parley_shared::protocol::SignalPayload;
use parley_shared::Address;
use tracing::{debug, trace};

use crate::error::NetError;
use crate::subscribers::{Subscribers, Subscription};

/// Default buffer of a signal subscription.
pub const SIGNAL_BUFFER: usize = 64;

/// A payload together with its sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalEnvelope {
    pub from: Address,
    pub payload: SignalPayload,
}

#[async_trait]
pub trait SignalChannel: Send + Sync {
    async fn send_signal(&self, to: &Address, payload: SignalPayload) -> Result<(), NetError>;

    /// Payloads addressed to the local identity.
    fn subscribe(&self) -> Subscription<SignalEnvelope>;

    /// Whether [`SignalChannel::send_signal`] can currently succeed.
    fn is_available(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// In-process hub
// ---------------------------------------------------------------------------

/// Routes payloads between channels created from the same hub.
#[derive(Clone, Default)]
pub struct MemorySignalHub {
    inboxes: Arc<Mutex<HashMap<Address, Arc<Subscribers<SignalEnvelope>>>>>,
}

impl MemorySignalHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self, local: Address) -> MemorySignalChannel {
        let inbox = self
            .inboxes
            .lock()
            .map(|mut inboxes| {
                inboxes
                    .entry(local.clone())
                    .or_insert_with(|| Arc::new(Subscribers::new(SIGNAL_BUFFER)))
                    .clone()
            })
            .unwrap_or_else(|_| Arc::new(Subscribers::new(SIGNAL_BUFFER)));
        MemorySignalChannel {
            hub: self.clone(),
            local,
            inbox,
        }
    }

    fn deliver(&self, to: &Address, envelope: SignalEnvelope) -> usize {
        let inbox = self
            .inboxes
            .lock()
            .ok()
            .and_then(|inboxes| inboxes.get(to).cloned());
        match inbox {
            Some(inbox) => inbox.publish(envelope),
            None => 0,
        }
    }
}

pub struct MemorySignalChannel {
    hub: MemorySignalHub,
    local: Address,
    inbox: Arc<Subscribers<SignalEnvelope>>,
}

#[async_trait]
impl SignalChannel for MemorySignalChannel {
    async fn send_signal(&self, to: &Address, payload: SignalPayload) -> Result<(), NetError> {
        let envelope = SignalEnvelope {
            from: self.local.clone(),
            payload,
        };
        let delivered = self.hub.deliver(to, envelope);
        trace!(to = %to.short(), delivered, "memory signal");
        Ok(())
    }

    fn subscribe(&self) -> Subscription<SignalEnvelope> {
        self.inbox.subscribe()
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// Failover
// ---------------------------------------------------------------------------

/// Sends through `primary` while it is available and through `fallback`
/// otherwise. Subscribers see payloads arriving on either channel.
pub struct FailoverSignalChannel {
    primary: Arc<dyn SignalChannel>,
    fallback: Arc<dyn SignalChannel>,
    inbox: Arc<Subscribers<SignalEnvelope>>,
}

impl FailoverSignalChannel {
    /// Must be called inside a tokio runtime: one forwarding task per inner
    /// channel is spawned and lives as long as that channel's subscription.
    pub fn spawn(primary: Arc<dyn SignalChannel>, fallback: Arc<dyn SignalChannel>) -> Arc<Self> {
        let inbox = Arc::new(Subscribers::new(SIGNAL_BUFFER));

        for channel in [&primary, &fallback] {
            let mut subscription = channel.subscribe();
            let weak = Arc::downgrade(&inbox);
            let name = channel.name();
            tokio::spawn(async move {
                while let Some(envelope) = subscription.recv().await {
                    let Some(inbox) = weak.upgrade() else { break };
                    inbox.publish(envelope);
                }
                debug!(channel = name, "signal forwarding stopped");
            });
        }

        Arc::new(Self {
            primary,
            fallback,
            inbox,
        })
    }

    fn active(&self) -> &Arc<dyn SignalChannel> {
        if self.primary.is_available() {
            &self.primary
        } else {
            &self.fallback
        }
    }
}

#[async_trait]
impl SignalChannel for FailoverSignalChannel {
    async fn send_signal(&self, to: &Address, payload: SignalPayload) -> Result<(), NetError> {
        let channel = self.active();
        trace!(via = channel.name(), to = %to.short(), "signal");
        channel.send_signal(to, payload).await
    }

    fn subscribe(&self) -> Subscription<SignalEnvelope> {
        self.inbox.subscribe()
    }

    fn is_available(&self) -> bool {
        self.primary.is_available() || self.fallback.is_available()
    }

    fn name(&self) -> &'static str {
        "failover"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use parley_shared::protocol::{SessionRef, TypingState};

    use super::*;

    fn typing(is_typing: bool) -> SignalPayload {
        SignalPayload::Typing(TypingState {
            group_id: None,
            is_typing,
        })
    }

    #[tokio::test]
    async fn hub_routes_by_recipient() {
        let hub = MemorySignalHub::new();
        let alice = hub.channel(Address::new("aa"));
        let bob = hub.channel(Address::new("bb"));
        let mut bob_rx = bob.subscribe();
        let mut alice_rx = alice.subscribe();

        alice.send_signal(&Address::new("bb"), typing(true)).await.unwrap();

        let envelope = bob_rx.recv().await.unwrap();
        assert_eq!(envelope.from, Address::new("aa"));
        assert_eq!(envelope.payload, typing(true));
        assert!(alice_rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn unknown_recipient_is_dropped() {
        let hub = MemorySignalHub::new();
        let alice = hub.channel(Address::new("aa"));
        alice.send_signal(&Address::new("zz"), typing(false)).await.unwrap();
    }

    struct Toggle {
        inner: MemorySignalChannel,
        up: AtomicBool,
    }

    #[async_trait]
    impl SignalChannel for Toggle {
        async fn send_signal(&self, to: &Address, payload: SignalPayload) -> Result<(), NetError> {
            self.inner.send_signal(to, payload).await
        }
        fn subscribe(&self) -> Subscription<SignalEnvelope> {
            self.inner.subscribe()
        }
        fn is_available(&self) -> bool {
            self.up.load(Ordering::SeqCst)
        }
        fn name(&self) -> &'static str {
            "toggle"
        }
    }

    #[tokio::test]
    async fn failover_uses_fallback_when_primary_down() {
        let relay_hub = MemorySignalHub::new();
        let table_hub = MemorySignalHub::new();
        let mut bob_relay = relay_hub.channel(Address::new("bb")).subscribe();
        let mut bob_table = table_hub.channel(Address::new("bb")).subscribe();

        let primary = Arc::new(Toggle {
            inner: relay_hub.channel(Address::new("aa")),
            up: AtomicBool::new(true),
        });
        let failover = FailoverSignalChannel::spawn(
            primary.clone(),
            Arc::new(table_hub.channel(Address::new("aa"))),
        );

        let hangup = SignalPayload::Hangup(SessionRef { session: "s".into() });
        failover.send_signal(&Address::new("bb"), hangup.clone()).await.unwrap();
        assert_eq!(bob_relay.recv().await.unwrap().payload, hangup);

        primary.up.store(false, Ordering::SeqCst);
        failover.send_signal(&Address::new("bb"), typing(true)).await.unwrap();
        assert_eq!(bob_table.recv().await.unwrap().payload, typing(true));
        assert!(bob_relay.try_recv().is_none());
    }

    #[tokio::test]
    async fn failover_merges_inbound() {
        let relay_hub = MemorySignalHub::new();
        let table_hub = MemorySignalHub::new();
        let failover = FailoverSignalChannel::spawn(
            Arc::new(relay_hub.channel(Address::new("aa"))),
            Arc::new(table_hub.channel(Address::new("aa"))),
        );
        let mut inbox = failover.subscribe();

        relay_hub
            .channel(Address::new("bb"))
            .send_signal(&Address::new("aa"), typing(true))
            .await
            .unwrap();
        table_hub
            .channel(Address::new("cc"))
            .send_signal(&Address::new("aa"), typing(false))
            .await
            .unwrap();

        let mut senders = vec![
            inbox.recv().await.unwrap().from,
            inbox.recv().await.unwrap().from,
        ];
        senders.sort();
        assert_eq!(senders, [Address::new("bb"), Address::new("cc")]);
    }
}
