/// Application name
pub const APP_NAME: &str = "Parley";

/// Wire protocol version advertised by the relay
pub const PROTOCOL_VERSION: &str = "parley/1";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// X25519 / Ed25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Secret key / seed size in bytes
pub const SECRET_KEY_SIZE: usize = 32;

/// Maximum serialized frame size accepted by the relay (256 KiB)
pub const MAX_FRAME_SIZE: usize = 262_144;

/// Messages kept per conversation in the local store
pub const LOCAL_HISTORY_CAP: usize = 1_000;

/// Messages kept per conversation by the relay
pub const RELAY_HISTORY_CAP: usize = 100;

/// Buffered messages kept per offline recipient by the relay
pub const OFFLINE_BUFFER_CAP: usize = 500;

/// Quiet period after which a typing indicator expires
pub const TYPING_EXPIRY_SECS: u64 = 5;

/// Username length bounds (inclusive)
pub const USERNAME_MIN_LEN: usize = 3;
pub const USERNAME_MAX_LEN: usize = 20;

/// Default HTTP / WebSocket port of the relay
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Placeholder shown for messages that failed authentication
pub const DECRYPTION_FAILED_PLACEHOLDER: &str = "[unable to decrypt message]";

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_IDENTITY_SEED: &str = "parley-identity-seed-v1";
pub const KDF_CONTEXT_BOX_KEY: &str = "parley-box-key-v1";
