//! Request/response client for the relay.
//!
//! The client runs over a *pipe*: a sender of [`ClientRequest`]s and a
//! receiver of [`ServerResponse`]s. [`RelayClient::connect_ws`] builds the
//! pipe from a WebSocket; [`RelayClient::attach`] accepts any other pipe,
//! such as an in-process relay. Replies are matched to requests by
//! `requestId`. Unrequested messages and receipts go to
//! [`RelayApi::subscribe_deliveries`], everything else to
//! [`RelayApi::subscribe`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parley_net::{NetError, PublicKeyInfo, RelayApi, Subscribers, Subscription};
use parley_shared::protocol::{
    AddressRequest, ClientFrame, ClientRequest, DeliveryStatus, HistoryRequest, ReceiptKind,
    ReceiptRequest, RegisterRequest, RegisteredUser, RelayedMessage, ServerFrame,
    ServerResponse, SignalPayload, SignalRequest, UserInfo, UserSummary, UsernameRequest,
    UsernameResult,
};
use parley_shared::Address;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;

type Pending = HashMap<u64, oneshot::Sender<ServerFrame>>;

#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<Inner>,
}

struct Inner {
    pipe: Mutex<Option<Pipe>>,
    pending: Mutex<Pending>,
    next_request: AtomicU64,
    generation: AtomicU64,
    deliveries: Subscribers<ServerFrame>,
    pushes: Subscribers<ServerFrame>,
    request_timeout: Duration,
}

struct Pipe {
    generation: u64,
    outbound: mpsc::UnboundedSender<ClientRequest>,
}

impl RelayClient {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                pipe: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_request: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                deliveries: Subscribers::unbounded(),
                pushes: Subscribers::new(config.event_capacity),
                request_timeout: config.request_timeout,
            }),
        }
    }

    /// Open a WebSocket to `url` and use it as the pipe.
    pub async fn connect_ws(&self, url: &str) -> Result<(), NetError> {
        let (socket, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| NetError::Transport(e.to_string()))?;
        let (mut sink, mut stream) = socket.split();

        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<ClientRequest>();
        let (response_tx, response_rx) = mpsc::unbounded_channel::<ServerResponse>();

        tokio::spawn(async move {
            while let Some(request) = request_rx.recv().await {
                let text = match request.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "dropping unencodable request");
                        continue;
                    }
                };
                if sink.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(Ok(message)) = stream.next().await {
                let text = match message {
                    WsMessage::Text(text) => text,
                    WsMessage::Close(_) => break,
                    _ => continue,
                };
                match ServerResponse::from_json(&text) {
                    Ok(response) => {
                        if response_tx.send(response).is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(error = %e, "ignoring malformed relay frame"),
                }
            }
        });

        info!(%url, "connected to relay");
        self.attach(request_tx, response_rx);
        Ok(())
    }

    /// Use `outbound` / `inbound` as the pipe, replacing any previous one.
    pub fn attach(
        &self,
        outbound: mpsc::UnboundedSender<ClientRequest>,
        mut inbound: mpsc::UnboundedReceiver<ServerResponse>,
    ) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.inner.pipe() = Some(Pipe {
            generation,
            outbound,
        });

        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(response) = inbound.recv().await {
                let Some(inner) = inner.upgrade() else { return };
                inner.route(response);
            }
            if let Some(inner) = inner.upgrade() {
                inner.close(generation);
            }
        });
    }

    /// Drop the current pipe. Requests in flight fail with
    /// [`NetError::ChannelClosed`].
    pub fn detach(&self) {
        let generation = self.inner.generation.load(Ordering::SeqCst);
        self.inner.close(generation);
    }

    async fn request(&self, frame: ClientFrame) -> Result<ServerFrame, NetError> {
        let outbound = self.inner.outbound().ok_or(NetError::NotConnected)?;
        let request_id = self.inner.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending().insert(request_id, tx);

        if outbound
            .send(ClientRequest::new(Some(request_id), frame))
            .is_err()
        {
            self.inner.pending().remove(&request_id);
            return Err(NetError::ChannelClosed);
        }

        let timeout = self.inner.request_timeout;
        let frame = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(_)) => return Err(NetError::ChannelClosed),
            Err(_) => {
                self.inner.pending().remove(&request_id);
                return Err(NetError::Timeout(timeout));
            }
        };
        match frame {
            ServerFrame::Error(notice) => Err(NetError::Rejected(notice.message)),
            frame => Ok(frame),
        }
    }

    // Frames the relay does not answer.
    fn fire(&self, frame: ClientFrame) -> Result<(), NetError> {
        let outbound = self.inner.outbound().ok_or(NetError::NotConnected)?;
        outbound
            .send(ClientRequest::new(None, frame))
            .map_err(|_| NetError::ChannelClosed)
    }
}

impl Inner {
    fn pipe(&self) -> MutexGuard<'_, Option<Pipe>> {
        self.pipe.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn outbound(&self) -> Option<mpsc::UnboundedSender<ClientRequest>> {
        self.pipe()
            .as_ref()
            .filter(|pipe| !pipe.outbound.is_closed())
            .map(|pipe| pipe.outbound.clone())
    }

    fn route(&self, response: ServerResponse) {
        let waiter = response
            .request_id
            .and_then(|id| self.pending().remove(&id));
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(response.frame);
            }
            None => match response.frame {
                frame @ (ServerFrame::Message(_)
                | ServerFrame::MessageSent(_)
                | ServerFrame::MessageReceipt(_)) => {
                    self.deliveries.publish(frame);
                }
                frame => {
                    self.pushes.publish(frame);
                }
            },
        }
    }

    // Tear down pipe `generation` if it is still the current one.
    fn close(&self, generation: u64) {
        let mut pipe = self.pipe();
        if pipe.as_ref().map(|p| p.generation) != Some(generation) {
            return;
        }
        *pipe = None;
        drop(pipe);
        let abandoned = std::mem::take(&mut *self.pending());
        debug!(abandoned = abandoned.len(), "relay pipe closed");
    }
}

fn unexpected(frame: ServerFrame) -> NetError {
    NetError::UnexpectedReply(format!("{frame:?}"))
}

#[async_trait]
impl RelayApi for RelayClient {
    fn is_connected(&self) -> bool {
        self.inner.outbound().is_some()
    }

    async fn register(
        &self,
        address: &Address,
        public_key: &str,
        username: Option<&str>,
    ) -> Result<RegisteredUser, NetError> {
        let frame = ClientFrame::Register(RegisterRequest {
            address: address.clone(),
            public_key: public_key.to_string(),
            username: username.map(str::to_string),
        });
        match self.request(frame).await? {
            ServerFrame::Registered(user) => Ok(user),
            other => Err(unexpected(other)),
        }
    }

    async fn set_username(&self, username: &str) -> Result<UsernameResult, NetError> {
        let frame = ClientFrame::SetUsername(UsernameRequest {
            username: username.to_string(),
        });
        match self.request(frame).await? {
            ServerFrame::UsernameResult(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    async fn lookup_by_username(&self, username: &str) -> Result<Option<UserSummary>, NetError> {
        let frame = ClientFrame::LookupByUsername(UsernameRequest {
            username: username.to_string(),
        });
        match self.request(frame).await? {
            ServerFrame::UserLookup(lookup) => Ok(lookup.user),
            other => Err(unexpected(other)),
        }
    }

    async fn get_public_key(&self, address: &Address) -> Result<Option<PublicKeyInfo>, NetError> {
        let frame = ClientFrame::GetPublicKey(AddressRequest {
            address: address.clone(),
        });
        match self.request(frame).await? {
            ServerFrame::PublicKey(key) => Ok(key.public_key.map(|public_key| PublicKeyInfo {
                public_key,
                online: key.online,
            })),
            other => Err(unexpected(other)),
        }
    }

    async fn get_user(&self, address: &Address) -> Result<Option<UserInfo>, NetError> {
        let frame = ClientFrame::GetUser(AddressRequest {
            address: address.clone(),
        });
        match self.request(frame).await? {
            ServerFrame::User(response) => Ok(response.user),
            other => Err(unexpected(other)),
        }
    }

    async fn check_online(&self, address: &Address) -> Result<bool, NetError> {
        let frame = ClientFrame::CheckOnline(AddressRequest {
            address: address.clone(),
        });
        match self.request(frame).await? {
            ServerFrame::OnlineStatus(status) => Ok(status.online),
            other => Err(unexpected(other)),
        }
    }

    async fn send_message(&self, message: RelayedMessage) -> Result<DeliveryStatus, NetError> {
        match self.request(ClientFrame::SendMessage(message)).await? {
            ServerFrame::MessageStatus(notice) => Ok(notice.status),
            other => Err(unexpected(other)),
        }
    }

    async fn send_receipt(
        &self,
        message_id: &str,
        to: &Address,
        kind: ReceiptKind,
    ) -> Result<(), NetError> {
        self.fire(ClientFrame::MessageReceipt(ReceiptRequest {
            message_id: message_id.to_string(),
            to: to.clone(),
            receipt_type: kind,
        }))
    }

    async fn send_signal(&self, to: &Address, signal: SignalPayload) -> Result<(), NetError> {
        self.fire(ClientFrame::Signal(SignalRequest {
            to: to.clone(),
            signal,
        }))
    }

    async fn get_history(&self, peer: &Address) -> Result<Vec<RelayedMessage>, NetError> {
        let frame = ClientFrame::GetHistory(HistoryRequest {
            peer_address: peer.clone(),
        });
        match self.request(frame).await? {
            ServerFrame::History(history) => Ok(history.messages),
            other => Err(unexpected(other)),
        }
    }

    fn subscribe_deliveries(&self) -> Subscription<ServerFrame> {
        self.inner.deliveries.subscribe()
    }

    fn subscribe(&self) -> Subscription<ServerFrame> {
        self.inner.pushes.subscribe()
    }
}
