//! # parley-net
//!
//! Transport plumbing shared by the client and the relay:
//!
//! - [`SignalChannel`] and its in-process implementations, used to negotiate
//!   direct sessions and carry typing indicators,
//! - [`DirectTransport`] with TCP and in-memory links,
//! - [`ConnectionManager`], the per-peer direct connection state machine,
//! - [`RelayApi`], the request surface of the relay service.

pub mod connection;
pub mod error;
pub mod peers;
pub mod relay_api;
pub mod shared_table;
pub mod signal;
pub mod subscribers;
pub mod transport;

pub use connection::{ConnectionConfig, ConnectionManager, PeerHandle, PeerStateChange};
pub use error::NetError;
pub use peers::PeerState;
pub use relay_api::{PublicKeyInfo, RelayApi};
pub use shared_table::{SharedTableSignalChannel, SignalTable};
pub use signal::{FailoverSignalChannel, MemorySignalHub, SignalChannel, SignalEnvelope};
pub use subscribers::{Subscribers, Subscription};
pub use transport::{DirectTransport, Link, MemoryTransport, PendingLink, TcpTransport};
