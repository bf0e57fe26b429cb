//! # parley-server
//!
//! Store-and-forward relay for Parley clients.
//!
//! - **Presence** and a case-insensitive **username directory**
//! - **Message relay** with a bounded per-conversation history and an
//!   offline buffer drained when the recipient registers
//! - **Signal and receipt forwarding** between connected clients
//! - **WebSocket** endpoint (`/ws`) plus a small REST API (axum)
//! - **Rate limiting** per IP on REST and per connection on the socket
//!
//! The relay only ever sees ciphertext.

pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod loopback;
pub mod rate_limit;
pub mod service;
pub mod ws;

pub use api::{build_router, serve, AppState};
pub use config::ServerConfig;
pub use error::{ServerError, UsernameError};
pub use service::{ConnectionHandle, RelayLimits, RelayService};
