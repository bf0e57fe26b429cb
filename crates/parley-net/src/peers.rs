//! Direct-connection bookkeeping.
//!
//! Maintains one entry per peer address with its connection state, the
//! session it belongs to and, once connected, the sender half of the link.
//! Entries exist only while a session is connecting or connected.

use std::collections::HashMap;

use parley_shared::types::now_ms;
use parley_shared::Address;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// Connection state of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Idle,
    Connecting,
    Connected,
    /// Reported as a state change only; the table then forgets the peer.
    Disconnected,
}

/// Which side sent the offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug)]
pub struct PeerEntry {
    pub state: PeerState,
    pub session: String,
    pub role: Role,
    pub outbound: Option<mpsc::Sender<String>>,
    /// Unix millis of the last state change.
    pub since: i64,
}

/// Tracks every peer with a direct session in progress or established.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<Address, PeerEntry>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, peer: &Address) -> PeerState {
        self.peers
            .get(peer)
            .map(|entry| entry.state)
            .unwrap_or(PeerState::Idle)
    }

    pub fn get(&self, peer: &Address) -> Option<&PeerEntry> {
        self.peers.get(peer)
    }

    pub fn session(&self, peer: &Address) -> Option<&str> {
        self.peers
            .get(peer)
            .filter(|entry| matches!(entry.state, PeerState::Connecting | PeerState::Connected))
            .map(|entry| entry.session.as_str())
    }

    /// Start a session, replacing whatever the peer had before.
    pub fn begin(&mut self, peer: Address, session: String, role: Role) {
        debug!(peer = %peer.short(), %session, ?role, "connecting");
        self.peers.insert(
            peer,
            PeerEntry {
                state: PeerState::Connecting,
                session,
                role,
                outbound: None,
                since: now_ms(),
            },
        );
    }

    /// Attach an established link. Fails if the peer moved on to another
    /// session in the meantime.
    pub fn on_connected(
        &mut self,
        peer: &Address,
        session: &str,
        outbound: mpsc::Sender<String>,
    ) -> bool {
        match self.peers.get_mut(peer) {
            Some(entry) if entry.session == session && entry.state == PeerState::Connecting => {
                entry.state = PeerState::Connected;
                entry.outbound = Some(outbound);
                entry.since = now_ms();
                debug!(peer = %peer.short(), %session, "connected");
                true
            }
            _ => false,
        }
    }

    /// Discard the peer's entry if `session` (or any session when `None`)
    /// is still current, leaving the peer `Idle`. Returns whether an entry
    /// was dropped.
    pub fn on_disconnected(&mut self, peer: &Address, session: Option<&str>) -> bool {
        let current = self
            .peers
            .get(peer)
            .is_some_and(|entry| session.map_or(true, |s| s == entry.session));
        if !current {
            return false;
        }
        if let Some(entry) = self.peers.remove(peer) {
            debug!(peer = %peer.short(), session = %entry.session, "disconnected");
        }
        true
    }

    pub fn outbound(&self, peer: &Address) -> Option<mpsc::Sender<String>> {
        self.peers
            .get(peer)
            .filter(|entry| entry.state == PeerState::Connected)
            .and_then(|entry| entry.outbound.clone())
    }

    /// Addresses of all connected peers.
    pub fn connected(&self) -> Vec<Address> {
        let mut peers: Vec<_> = self
            .peers
            .iter()
            .filter(|(_, entry)| entry.state == PeerState::Connected)
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }
}
