//! Direct peer links.
//!
//! A [`Link`] is a bidirectional stream of JSON text frames. One side
//! prepares a [`PendingLink`] for a session and advertises its endpoints;
//! the other side dials one of them presenting the same session id.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parley_shared::constants::MAX_FRAME_SIZE;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::error::NetError;

const LINK_BUFFER: usize = 64;

/// An established link.
pub struct Link {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

impl Link {
    /// Two connected ends.
    pub fn pair() -> (Link, Link) {
        let (a_tx, a_rx) = mpsc::channel(LINK_BUFFER);
        let (b_tx, b_rx) = mpsc::channel(LINK_BUFFER);
        (
            Link {
                outbound: a_tx,
                inbound: b_rx,
            },
            Link {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }
}

/// A prepared local endpoint waiting for the peer to dial in.
pub struct PendingLink {
    /// Endpoints in preference order.
    pub endpoints: Vec<String>,
    pub accept: BoxFuture<'static, Result<Link, NetError>>,
}

#[async_trait]
pub trait DirectTransport: Send + Sync {
    async fn listen(&self, session: &str) -> Result<PendingLink, NetError>;

    async fn dial(&self, endpoint: &str, session: &str) -> Result<Link, NetError>;
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

/// Newline-delimited JSON over TCP. The first line on a new stream is the
/// session id.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    bind_host: String,
}

impl TcpTransport {
    pub fn new(bind_host: impl Into<String>) -> Self {
        Self {
            bind_host: bind_host.into(),
        }
    }

    pub fn loopback() -> Self {
        Self::new("127.0.0.1")
    }
}

#[async_trait]
impl DirectTransport for TcpTransport {
    async fn listen(&self, session: &str) -> Result<PendingLink, NetError> {
        let listener = TcpListener::bind((self.bind_host.as_str(), 0)).await?;
        let local: SocketAddr = listener.local_addr()?;
        let session = session.to_string();

        let accept: BoxFuture<'static, Result<Link, NetError>> = async move {
            loop {
                let (stream, remote) = listener.accept().await?;
                let mut reader = BufReader::new(stream);
                let mut first = String::new();
                reader.read_line(&mut first).await?;
                if first.trim_end() == session {
                    debug!(%remote, "direct link accepted");
                    return Ok(spawn_stream(reader));
                }
                warn!(%remote, "rejected dial with wrong session");
            }
        }
        .boxed();

        Ok(PendingLink {
            endpoints: vec![format!("tcp://{local}")],
            accept,
        })
    }

    async fn dial(&self, endpoint: &str, session: &str) -> Result<Link, NetError> {
        let addr = endpoint
            .strip_prefix("tcp://")
            .ok_or_else(|| NetError::Transport(format!("unsupported endpoint: {endpoint}")))?;
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(format!("{session}\n").as_bytes()).await?;
        Ok(spawn_stream(BufReader::new(stream)))
    }
}

fn spawn_stream(reader: BufReader<TcpStream>) -> Link {
    let (near, far) = Link::pair();
    let Link {
        outbound: to_app,
        inbound: mut from_app,
    } = far;

    // Split the buffered reader so bytes read past the session line are kept.
    let (read_half, mut write_half) = tokio::io::split(reader);

    tokio::spawn(async move {
        while let Some(frame) = from_app.recv().await {
            let line = frame.replace('\n', " ");
            if write_half.write_all(line.as_bytes()).await.is_err()
                || write_half.write_all(b"\n").await.is_err()
            {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.len() > MAX_FRAME_SIZE {
                warn!(size = line.len(), "oversized direct frame dropped");
                continue;
            }
            if to_app.send(line).await.is_err() {
                break;
            }
        }
        trace!("direct link reader finished");
    });

    near
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Links between transports sharing the same registry, for tests.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    listeners: Arc<Mutex<HashMap<String, (String, oneshot::Sender<Link>)>>>,
    refuse_dials: Arc<AtomicBool>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent dial from this registry fail, as if the peers
    /// could not reach each other directly.
    pub fn set_refuse_dials(&self, refuse: bool) {
        self.refuse_dials.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl DirectTransport for MemoryTransport {
    async fn listen(&self, session: &str) -> Result<PendingLink, NetError> {
        let endpoint = format!("mem://{}", uuid::Uuid::new_v4());
        let (tx, rx) = oneshot::channel();
        self.listeners
            .lock()
            .map_err(|_| NetError::Transport("registry poisoned".into()))?
            .insert(endpoint.clone(), (session.to_string(), tx));

        let accept: BoxFuture<'static, Result<Link, NetError>> =
            async move { rx.await.map_err(|_| NetError::ChannelClosed) }.boxed();
        Ok(PendingLink {
            endpoints: vec![endpoint],
            accept,
        })
    }

    async fn dial(&self, endpoint: &str, session: &str) -> Result<Link, NetError> {
        if self.refuse_dials.load(Ordering::SeqCst) {
            return Err(NetError::Transport(format!("unreachable: {endpoint}")));
        }
        let (expected, tx) = self
            .listeners
            .lock()
            .map_err(|_| NetError::Transport("registry poisoned".into()))?
            .remove(endpoint)
            .ok_or_else(|| NetError::Transport(format!("no listener at {endpoint}")))?;
        if expected != session {
            return Err(NetError::Transport("session mismatch".into()));
        }

        let (near, far) = Link::pair();
        tx.send(far).map_err(|_| NetError::ChannelClosed)?;
        Ok(near)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exchange(transport: &dyn DirectTransport) {
        let pending = transport.listen("s1").await.unwrap();
        let endpoint = pending.endpoints[0].clone();

        let (accepted, dialed) = tokio::join!(pending.accept, transport.dial(&endpoint, "s1"));
        let mut server = accepted.unwrap();
        let mut client = dialed.unwrap();

        client.outbound.send(r#"{"hello":1}"#.into()).await.unwrap();
        assert_eq!(server.inbound.recv().await.unwrap(), r#"{"hello":1}"#);

        server.outbound.send("pong".into()).await.unwrap();
        assert_eq!(client.inbound.recv().await.unwrap(), "pong");

        drop(server);
        assert!(client.inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn memory_link_exchanges_frames() {
        exchange(&MemoryTransport::new()).await;
    }

    #[tokio::test]
    async fn tcp_link_exchanges_frames() {
        exchange(&TcpTransport::loopback()).await;
    }

    #[tokio::test]
    async fn memory_dial_checks_session() {
        let transport = MemoryTransport::new();
        let pending = transport.listen("s1").await.unwrap();
        assert!(transport.dial(&pending.endpoints[0], "other").await.is_err());
        assert!(transport.dial("mem://missing", "s1").await.is_err());
    }

    #[tokio::test]
    async fn refused_dials_fail() {
        let transport = MemoryTransport::new();
        let pending = transport.listen("s1").await.unwrap();
        transport.set_refuse_dials(true);
        assert!(transport.dial(&pending.endpoints[0], "s1").await.is_err());
    }
}
