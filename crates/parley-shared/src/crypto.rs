use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::constants::{KDF_CONTEXT_BOX_KEY, KDF_CONTEXT_IDENTITY_SEED, NONCE_SIZE};
use crate::error::{CryptoError, IdentityError};

pub type SymmetricKey = [u8; 32];

/// X25519 key pair used for message encryption.
#[derive(Clone)]
pub struct KeyPair {
    pub public: [u8; 32],
    pub secret: [u8; 32],
}

impl KeyPair {
    pub fn from_secret(secret: [u8; 32]) -> Self {
        let public = PublicKey::from(&StaticSecret::from(secret)).to_bytes();
        Self { public, secret }
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

/// Output of [`encrypt`]. The nonce must travel with the ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_SIZE],
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn generate_key_pair() -> KeyPair {
    let mut secret = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    KeyPair::from_secret(secret)
}

/// Derive the 32-byte identity seed from a wallet signature.
///
/// The same signature always yields the same seed, which lets a user recover
/// their identity by signing again instead of storing keys on a server.
pub fn derive_seed(signature: &[u8]) -> Result<[u8; 32], IdentityError> {
    if signature.is_empty() {
        return Err(IdentityError::EmptySignature);
    }
    Ok(blake3::derive_key(KDF_CONTEXT_IDENTITY_SEED, signature))
}

pub fn derive_key_pair(signature: &[u8]) -> Result<KeyPair, IdentityError> {
    Ok(KeyPair::from_secret(derive_seed(signature)?))
}

// X25519 shared secret -> BLAKE3 KDF. Symmetric: (skA, pkB) == (skB, pkA).
fn box_key(own_secret: &[u8; 32], counterparty_public: &[u8; 32]) -> Option<SymmetricKey> {
    let secret = StaticSecret::from(*own_secret);
    let shared = secret.diffie_hellman(&PublicKey::from(*counterparty_public));
    if !shared.was_contributory() {
        return None;
    }
    Some(blake3::derive_key(KDF_CONTEXT_BOX_KEY, shared.as_bytes()))
}

/// Authenticated public-key encryption with a fresh random nonce per call.
pub fn encrypt(
    plaintext: &[u8],
    recipient_public: &[u8; 32],
    sender_secret: &[u8; 32],
) -> Result<Sealed, CryptoError> {
    let key = box_key(sender_secret, recipient_public).ok_or(CryptoError::EncryptionFailed)?;
    let cipher = XChaCha20Poly1305::new((&key).into());
    let nonce = generate_nonce();

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(Sealed { ciphertext, nonce })
}

/// Open a message. Fails closed with [`CryptoError::DecryptionFailed`] when
/// the counterparty key does not match.
pub fn decrypt(
    ciphertext: &[u8],
    nonce: &[u8],
    counterparty_public: &[u8; 32],
    own_secret: &[u8; 32],
) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::InvalidNonceLength);
    }
    let key = box_key(own_secret, counterparty_public).ok_or(CryptoError::DecryptionFailed)?;
    let cipher = XChaCha20Poly1305::new((&key).into());

    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Re-open a message this device sent. The counterparty is the *recipient*,
/// not ourselves.
pub fn open_own(
    ciphertext: &[u8],
    nonce: &[u8],
    recipient_public: &[u8; 32],
    sender_secret: &[u8; 32],
) -> Result<Vec<u8>, CryptoError> {
    decrypt(ciphertext, nonce, recipient_public, sender_secret)
}

pub fn encode_b64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn decode_b64(value: &str) -> Result<Vec<u8>, CryptoError> {
    Ok(BASE64.decode(value)?)
}

pub fn decode_key(value: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = decode_b64(value)?;
    bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength)
}
