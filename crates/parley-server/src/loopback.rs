//! In-process connection to a [`RelayService`], used by embedders and tests
//! that want relay semantics without a socket.

use std::sync::Arc;

use parley_shared::protocol::{ClientRequest, ServerResponse};
use tokio::sync::mpsc;
use tracing::debug;

use crate::service::RelayService;

/// Open a connection. Requests sent on the returned sender are dispatched in
/// order. Dropping the sender closes the connection like a socket close.
pub fn open(
    relay: Arc<RelayService>,
) -> (
    mpsc::UnboundedSender<ClientRequest>,
    mpsc::UnboundedReceiver<ServerResponse>,
) {
    let (request_tx, mut request_rx) = mpsc::unbounded_channel::<ClientRequest>();
    let (conn, responses) = relay.connect();

    tokio::spawn(async move {
        while let Some(request) = request_rx.recv().await {
            relay.handle_request(&conn, request).await;
        }
        relay.disconnect(&conn).await;
        debug!(conn = conn.id(), "loopback closed");
    });

    (request_tx, responses)
}
