use std::sync::Arc;

use async_trait::async_trait;
use parley_net::signal::SIGNAL_BUFFER;
use parley_net::{NetError, RelayApi, SignalChannel, SignalEnvelope, Subscribers, Subscription};
use parley_shared::protocol::{ServerFrame, SignalPayload};
use parley_shared::Address;
use tracing::{debug, trace};

/// [`SignalChannel`] over the relay's `signal` frames.
pub struct RelaySignalChannel {
    relay: Arc<dyn RelayApi>,
    inbox: Arc<Subscribers<SignalEnvelope>>,
}

impl RelaySignalChannel {
    /// Spawns a task that lifts `signal` pushes off the relay stream.
    pub fn spawn(relay: Arc<dyn RelayApi>) -> Arc<Self> {
        let inbox = Arc::new(Subscribers::new(SIGNAL_BUFFER));
        let mut pushes = relay.subscribe();
        let weak = Arc::downgrade(&inbox);
        tokio::spawn(async move {
            while let Some(frame) = pushes.recv().await {
                let ServerFrame::Signal(notice) = frame else { continue };
                let Some(inbox) = weak.upgrade() else { break };
                inbox.publish(SignalEnvelope {
                    from: notice.from,
                    payload: notice.signal,
                });
            }
            debug!("relay signal forwarding stopped");
        });
        Arc::new(Self { relay, inbox })
    }
}

#[async_trait]
impl SignalChannel for RelaySignalChannel {
    async fn send_signal(&self, to: &Address, payload: SignalPayload) -> Result<(), NetError> {
        trace!(to = %to.short(), "relay signal");
        self.relay.send_signal(to, payload).await
    }

    fn subscribe(&self) -> Subscription<SignalEnvelope> {
        self.inbox.subscribe()
    }

    fn is_available(&self) -> bool {
        self.relay.is_connected()
    }

    fn name(&self) -> &'static str {
        "relay"
    }
}
