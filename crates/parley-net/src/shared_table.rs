//! Signal channel over an eventually-consistent shared table.
//!
//! Writers append rows keyed by recipient; each reader drains its own rows
//! once per collection window. This stands in for a replicated P2P database
//! where writes become visible to other peers only after a sync round.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use parley_shared::protocol::SignalPayload;
use parley_shared::types::now_ms;
use parley_shared::Address;
use tracing::{debug, trace};

use crate::error::NetError;
use crate::signal::{SignalChannel, SignalEnvelope, SIGNAL_BUFFER};
use crate::subscribers::{Subscribers, Subscription};

/// Default collection window.
pub const DEFAULT_POLL_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct Row {
    from: Address,
    payload: SignalPayload,
    written_at: i64,
}

/// The replicated table. Clones share the same rows.
#[derive(Clone, Default)]
pub struct SignalTable {
    rows: Arc<Mutex<HashMap<Address, Vec<Row>>>>,
}

impl SignalTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn append(&self, to: &Address, row: Row) -> Result<(), NetError> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| NetError::Transport("signal table poisoned".into()))?;
        rows.entry(to.clone()).or_default().push(row);
        Ok(())
    }

    fn drain(&self, recipient: &Address) -> Vec<Row> {
        self.rows
            .lock()
            .ok()
            .and_then(|mut rows| rows.remove(recipient))
            .unwrap_or_default()
    }

    /// Rows written but not yet collected.
    pub fn pending(&self) -> usize {
        self.rows
            .lock()
            .map(|rows| rows.values().map(Vec::len).sum())
            .unwrap_or(0)
    }
}

pub struct SharedTableSignalChannel {
    table: SignalTable,
    local: Address,
    inbox: Arc<Subscribers<SignalEnvelope>>,
}

impl SharedTableSignalChannel {
    /// Start collecting rows for `local` every `window`. The poll task
    /// stops once the channel is dropped.
    pub fn spawn(table: SignalTable, local: Address, window: Duration) -> Arc<Self> {
        let inbox = Arc::new(Subscribers::new(SIGNAL_BUFFER));
        let channel = Arc::new(Self {
            table: table.clone(),
            local: local.clone(),
            inbox: inbox.clone(),
        });

        let weak = Arc::downgrade(&inbox);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(window);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inbox) = weak.upgrade() else { break };
                let mut rows = table.drain(&local);
                if rows.is_empty() {
                    continue;
                }
                rows.sort_by_key(|row| row.written_at);
                trace!(local = %local.short(), rows = rows.len(), "collected signal rows");
                for row in rows {
                    inbox.publish(SignalEnvelope {
                        from: row.from,
                        payload: row.payload,
                    });
                }
            }
            debug!(local = %local.short(), "shared table poller stopped");
        });

        channel
    }
}

#[async_trait]
impl SignalChannel for SharedTableSignalChannel {
    async fn send_signal(&self, to: &Address, payload: SignalPayload) -> Result<(), NetError> {
        self.table.append(
            to,
            Row {
                from: self.local.clone(),
                payload,
                written_at: now_ms(),
            },
        )
    }

    fn subscribe(&self) -> Subscription<SignalEnvelope> {
        self.inbox.subscribe()
    }

    fn name(&self) -> &'static str {
        "shared-table"
    }
}
