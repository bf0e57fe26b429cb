//! Per-peer direct connection state machine.
//!
//! ```text
//! idle ──connect/offer──▶ connecting ──link up──▶ connected
//!                              │                     │
//!                        timeout/error          close/hangup
//!                              ▼                     ▼
//!                          disconnected ◀────────────┘
//! ```
//!
//! Negotiation payloads (`offer`, `candidate`, `answer`, `hangup`) travel
//! over the [`SignalChannel`]; application payloads travel over the
//! [`Link`] produced by the [`DirectTransport`]. When both sides offer at
//! once, the offer from the lower address wins.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use parley_shared::protocol::{SessionOffer, SessionRef, SignalPayload};
use parley_shared::Address;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::peers::{PeerState, PeerTable, Role};
use crate::signal::{SignalChannel, SignalEnvelope};
use crate::subscribers::{Subscribers, Subscription};
use crate::transport::{DirectTransport, Link, PendingLink};

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long a session may stay in `connecting`.
    pub connect_timeout: Duration,
    /// Buffer of each state subscription. Data subscriptions are unbounded.
    pub event_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            event_capacity: 256,
        }
    }
}

/// A direct session that is being set up or is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHandle {
    pub peer: Address,
    pub session: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStateChange {
    pub peer: Address,
    pub state: PeerState,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    local: Address,
    signals: Arc<dyn SignalChannel>,
    transport: Arc<dyn DirectTransport>,
    peers: Mutex<PeerTable>,
    data: Subscribers<(Address, Value)>,
    states: Subscribers<PeerStateChange>,
    config: ConnectionConfig,
}

impl ConnectionManager {
    pub fn new(
        local: Address,
        signals: Arc<dyn SignalChannel>,
        transport: Arc<dyn DirectTransport>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                local,
                signals,
                transport,
                peers: Mutex::new(PeerTable::new()),
                data: Subscribers::unbounded(),
                states: Subscribers::new(config.event_capacity),
                config,
            }),
        }
    }

    /// Spawn the task answering negotiation payloads. It ends when the
    /// manager is dropped or the signal channel goes away.
    pub fn start(&self) -> JoinHandle<()> {
        let mut signals = self.inner.signals.subscribe();
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(envelope) = signals.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.on_signal(envelope);
            }
            debug!("connection signal loop stopped");
        })
    }

    pub fn local(&self) -> &Address {
        &self.inner.local
    }

    /// Begin a direct session with `peer`. Returns `None` when the peer is
    /// not online or the session could not be offered; the caller should use
    /// the relay instead.
    pub async fn connect(&self, peer: &Address, peer_online: bool) -> Option<PeerHandle> {
        if !peer_online || peer == &self.inner.local {
            return None;
        }
        if let Some(handle) = self.inner.current_handle(peer) {
            return Some(handle);
        }

        let session = uuid::Uuid::new_v4().to_string();
        let PendingLink { endpoints, accept } = match self.inner.transport.listen(&session).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(peer = %peer.short(), error = %e, "could not prepare direct endpoint");
                return None;
            }
        };

        {
            let mut peers = self.inner.peers();
            if let Some(session) = peers.session(peer) {
                return Some(PeerHandle {
                    peer: peer.clone(),
                    session: session.to_string(),
                });
            }
            peers.begin(peer.clone(), session.clone(), Role::Initiator);
        }
        self.inner.emit(peer, PeerState::Connecting);

        let Some((first, rest)) = endpoints.split_first() else {
            self.inner.fail(peer, Some(&session));
            return None;
        };
        let offer = SignalPayload::Offer(SessionOffer {
            session: session.clone(),
            endpoint: first.clone(),
        });
        if let Err(e) = self.inner.signals.send_signal(peer, offer).await {
            warn!(peer = %peer.short(), error = %e, "offer not sent");
            self.inner.fail(peer, Some(&session));
            return None;
        }
        for endpoint in rest {
            let candidate = SignalPayload::Candidate(SessionOffer {
                session: session.clone(),
                endpoint: endpoint.clone(),
            });
            if let Err(e) = self.inner.signals.send_signal(peer, candidate).await {
                debug!(peer = %peer.short(), error = %e, "candidate not sent");
            }
        }

        let inner = self.inner.clone();
        let target = peer.clone();
        let pending_session = session.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(inner.config.connect_timeout, accept).await {
                Ok(Ok(link)) => {
                    inner.attach(&target, &pending_session, link);
                }
                Ok(Err(e)) => {
                    debug!(peer = %target.short(), error = %e, "direct accept failed");
                    inner.fail(&target, Some(&pending_session));
                }
                Err(_) => {
                    debug!(peer = %target.short(), "direct connect timed out");
                    inner.fail(&target, Some(&pending_session));
                }
            }
        });

        Some(PeerHandle {
            peer: peer.clone(),
            session,
        })
    }

    /// Send an application payload over the direct link. `false` when the
    /// peer is not connected or the link just failed.
    pub async fn send<T: Serialize>(&self, peer: &Address, payload: &T) -> bool {
        let Some(outbound) = self.inner.peers().outbound(peer) else {
            return false;
        };
        let text = match serde_json::to_string(payload) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "payload not serializable");
                return false;
            }
        };
        if outbound.send(text).await.is_err() {
            self.inner.fail(peer, None);
            return false;
        }
        trace!(peer = %peer.short(), "direct send");
        true
    }

    /// Decoded payloads received over any direct link. None are dropped.
    pub fn subscribe_data(&self) -> Subscription<(Address, Value)> {
        self.inner.data.subscribe()
    }

    pub fn subscribe_states(&self) -> Subscription<PeerStateChange> {
        self.inner.states.subscribe()
    }

    pub fn state(&self, peer: &Address) -> PeerState {
        self.inner.peers().state(peer)
    }

    pub fn connected_peers(&self) -> Vec<Address> {
        self.inner.peers().connected()
    }

    /// Close the session with `peer` and tell it so.
    pub async fn disconnect(&self, peer: &Address) {
        let session = self.inner.peers().session(peer).map(str::to_string);
        let Some(session) = session else { return };
        self.inner.fail(peer, Some(&session));

        let hangup = SignalPayload::Hangup(SessionRef { session });
        if let Err(e) = self.inner.signals.send_signal(peer, hangup).await {
            debug!(peer = %peer.short(), error = %e, "hangup not sent");
        }
        info!(peer = %peer.short(), "direct session closed");
    }
}

impl Inner {
    fn peers(&self) -> MutexGuard<'_, PeerTable> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, peer: &Address, state: PeerState) {
        self.states.publish(PeerStateChange {
            peer: peer.clone(),
            state,
        });
    }

    fn current_handle(&self, peer: &Address) -> Option<PeerHandle> {
        self.peers().session(peer).map(|session| PeerHandle {
            peer: peer.clone(),
            session: session.to_string(),
        })
    }

    fn fail(&self, peer: &Address, session: Option<&str>) {
        if self.peers().on_disconnected(peer, session) {
            self.emit(peer, PeerState::Disconnected);
        }
    }

    fn on_signal(self: &Arc<Self>, envelope: SignalEnvelope) {
        let SignalEnvelope { from, payload } = envelope;
        match payload {
            SignalPayload::Offer(offer) => {
                let inner = self.clone();
                tokio::spawn(async move { inner.on_offer(from, offer).await });
            }
            SignalPayload::Candidate(candidate) => {
                let inner = self.clone();
                tokio::spawn(async move { inner.on_candidate(from, candidate).await });
            }
            SignalPayload::Answer(SessionRef { session }) => {
                trace!(peer = %from.short(), %session, "answer received");
            }
            SignalPayload::Hangup(SessionRef { session }) => {
                debug!(peer = %from.short(), %session, "peer hung up");
                self.fail(&from, Some(&session));
            }
            SignalPayload::Typing(_) => {}
        }
    }

    async fn on_offer(self: Arc<Self>, from: Address, offer: SessionOffer) {
        {
            let mut peers = self.peers();
            if let Some(entry) = peers.get(&from) {
                match entry.state {
                    // A dead link surfaces as a disconnect; until then keep it.
                    PeerState::Connected => {
                        trace!(peer = %from.short(), "offer while connected ignored");
                        return;
                    }
                    PeerState::Connecting if entry.session == offer.session => return,
                    PeerState::Connecting if entry.role == Role::Initiator => {
                        if self.local < from {
                            debug!(peer = %from.short(), "simultaneous offers, keeping ours");
                            return;
                        }
                        debug!(peer = %from.short(), "simultaneous offers, accepting theirs");
                    }
                    _ => {}
                }
            }
            peers.begin(from.clone(), offer.session.clone(), Role::Responder);
        }
        self.emit(&from, PeerState::Connecting);

        let watchdog = Arc::downgrade(&self);
        let timeout = self.config.connect_timeout;
        let (peer, session) = (from.clone(), offer.session.clone());
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = watchdog.upgrade() {
                let stalled = {
                    let peers = inner.peers();
                    peers.state(&peer) == PeerState::Connecting
                        && peers.session(&peer) == Some(session.as_str())
                };
                if stalled {
                    debug!(peer = %peer.short(), "offer never completed");
                    inner.fail(&peer, Some(&session));
                }
            }
        });

        self.dial(&from, &offer.session, &offer.endpoint).await;
    }

    async fn on_candidate(self: Arc<Self>, from: Address, candidate: SessionOffer) {
        let pending = {
            let peers = self.peers();
            peers.get(&from).is_some_and(|entry| {
                entry.role == Role::Responder
                    && entry.state == PeerState::Connecting
                    && entry.session == candidate.session
            })
        };
        if pending {
            self.dial(&from, &candidate.session, &candidate.endpoint).await;
        }
    }

    async fn dial(self: &Arc<Self>, peer: &Address, session: &str, endpoint: &str) {
        match self.transport.dial(endpoint, session).await {
            Ok(link) => {
                if self.attach(peer, session, link) {
                    let answer = SignalPayload::Answer(SessionRef {
                        session: session.to_string(),
                    });
                    if let Err(e) = self.signals.send_signal(peer, answer).await {
                        debug!(peer = %peer.short(), error = %e, "answer not sent");
                    }
                }
            }
            Err(e) => {
                debug!(peer = %peer.short(), %endpoint, error = %e, "dial failed, waiting for candidates");
            }
        }
    }

    fn attach(self: &Arc<Self>, peer: &Address, session: &str, link: Link) -> bool {
        let Link {
            outbound,
            mut inbound,
        } = link;
        if !self.peers().on_connected(peer, session, outbound) {
            return false;
        }
        self.emit(peer, PeerState::Connected);
        info!(peer = %peer.short(), "direct session established");

        let weak: Weak<Inner> = Arc::downgrade(self);
        let (peer, session) = (peer.clone(), session.to_string());
        tokio::spawn(async move {
            while let Some(line) = inbound.recv().await {
                let Some(inner) = weak.upgrade() else { return };
                match serde_json::from_str::<Value>(&line) {
                    Ok(value) => {
                        inner.data.publish((peer.clone(), value));
                    }
                    Err(e) => warn!(peer = %peer.short(), error = %e, "undecodable direct payload"),
                }
            }
            if let Some(inner) = weak.upgrade() {
                inner.fail(&peer, Some(&session));
            }
        });
        true
    }
}
