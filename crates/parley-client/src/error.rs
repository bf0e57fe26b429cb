use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    /// Nothing can be encrypted or decrypted; the user must sign in again.
    #[error("No key material for {0}")]
    NoKeyMaterial(String),

    #[error("Unknown conversation: {0}")]
    UnknownConversation(String),

    #[error("Store error: {0}")]
    Store(#[from] parley_store::StoreError),

    #[error("Network error: {0}")]
    Net(#[from] parley_net::NetError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] parley_shared::CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] parley_shared::ProtocolError),
}

pub type Result<T> = std::result::Result<T, ClientError>;
