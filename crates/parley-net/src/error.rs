use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("Channel closed")]
    ChannelClosed,

    #[error("Not connected to relay")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] parley_shared::ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Rejected by relay: {0}")]
    Rejected(String),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),
}
