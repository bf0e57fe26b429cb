use parley_shared::protocol::{
    ClientFrame, ClientRequest, ErrorNotice, HistoryResponse, MessageStatusNotice, OnlineStatus,
    ServerFrame, ServerResponse, UserLookup, UserResponse, UsernameResult,
};
use tracing::debug;

use crate::error::ServerError;
use crate::service::{ConnectionHandle, RelayService};

impl RelayService {
    /// Apply one client frame and queue the reply (if any) on `conn`.
    ///
    /// Every request/response frame echoes the caller's `requestId`.
    /// Receipts and signals are fire-and-forget and get no reply unless
    /// they fail.
    pub async fn handle_request(&self, conn: &ConnectionHandle, request: ClientRequest) {
        let request_id = request.request_id;
        let reply = |frame| conn.send(ServerResponse::reply(request_id, frame));

        let result: Result<(), ServerError> = async {
            match request.frame {
                ClientFrame::Register(register) => {
                    let registered = self.register(conn, register).await?;
                    reply(ServerFrame::Registered(registered));
                }
                ClientFrame::SetUsername(req) => {
                    let result = match self.set_username(conn, &req.username).await {
                        Ok(username) => UsernameResult {
                            success: true,
                            username: Some(username),
                            error: None,
                        },
                        Err(e) => UsernameResult {
                            success: false,
                            username: None,
                            error: Some(e.to_string()),
                        },
                    };
                    reply(ServerFrame::UsernameResult(result));
                }
                ClientFrame::LookupByUsername(req) => {
                    let user = self.lookup_by_username(&req.username).await;
                    reply(ServerFrame::UserLookup(UserLookup { user }));
                }
                ClientFrame::GetPublicKey(req) => {
                    let key = self.get_public_key(&req.address).await;
                    reply(ServerFrame::PublicKey(key));
                }
                ClientFrame::SendMessage(message) => {
                    let (status, relayed) = self.relay_message(conn, message).await?;
                    reply(ServerFrame::MessageStatus(MessageStatusNotice {
                        id: relayed.id.clone(),
                        status,
                    }));
                    conn.push(ServerFrame::MessageSent(relayed));
                }
                ClientFrame::MessageReceipt(receipt) => {
                    self.relay_receipt(conn, receipt).await?;
                }
                ClientFrame::Signal(signal) => {
                    if !self.relay_signal(conn, &signal.to, signal.signal).await? {
                        debug!(to = %signal.to.short(), "signal target offline, dropped");
                    }
                }
                ClientFrame::GetHistory(req) => {
                    let messages = self.get_history(conn, &req.peer_address).await?;
                    reply(ServerFrame::History(HistoryResponse {
                        peer_address: req.peer_address,
                        messages,
                    }));
                }
                ClientFrame::CheckOnline(req) => {
                    let online = self.check_online(&req.address).await;
                    reply(ServerFrame::OnlineStatus(OnlineStatus {
                        address: req.address,
                        online,
                    }));
                }
                ClientFrame::GetUser(req) => {
                    let user = self.get_user(&req.address).await;
                    reply(ServerFrame::User(UserResponse { user }));
                }
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            debug!(conn = conn.id(), error = %e, "request rejected");
            reply(ServerFrame::Error(ErrorNotice {
                message: e.to_string(),
            }));
        }
    }
}
