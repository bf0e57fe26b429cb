use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use parley_shared::constants::MAX_FRAME_SIZE;
use parley_shared::protocol::{ClientRequest, ErrorNotice, ServerFrame, ServerResponse};
use tracing::{debug, warn};

use crate::api::AppState;
use crate::error::ServerError;
use crate::rate_limit::TokenBucket;
use crate::service::RelayService;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let bucket = state.rate_limiter.bucket();
    ws.max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state.relay, bucket))
}

async fn handle_socket(socket: WebSocket, relay: Arc<RelayService>, mut bucket: TokenBucket) {
    let (mut sink, mut stream) = socket.split();
    let (conn, mut outbound) = relay.connect();

    let mut send_task = tokio::spawn(async move {
        while let Some(response) = outbound.recv().await {
            let text = match response.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "dropping unencodable frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let recv_relay = relay.clone();
    let recv_conn = conn.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };

            if !bucket.try_consume() {
                recv_conn.push(ServerFrame::Error(ErrorNotice {
                    message: ServerError::RateLimited.to_string(),
                }));
                continue;
            }

            match ClientRequest::from_json(&text) {
                Ok(request) => recv_relay.handle_request(&recv_conn, request).await,
                Err(e) => {
                    debug!(conn = recv_conn.id(), error = %e, "malformed frame");
                    recv_conn.send(ServerResponse::push(ServerFrame::Error(ErrorNotice {
                        message: format!("Invalid frame: {e}"),
                    })));
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    relay.disconnect(&conn).await;
    debug!(conn = conn.id(), "socket closed");
}
