use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;

use crate::crypto::{self, KeyPair};
use crate::error::IdentityError;
use crate::types::Address;

/// A user's cryptographic identity.
///
/// One 32-byte seed yields both the Ed25519 signing key (whose public half is
/// the [`Address`]) and the X25519 key pair used for message encryption. The
/// seed is derived from a wallet signature, so no server ever stores keys.
#[derive(Clone)]
pub struct Identity {
    seed: [u8; 32],
    signing_key: SigningKey,
    box_keys: KeyPair,
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    /// Recover the identity bound to a wallet signature
    pub fn from_signature(signature: &[u8]) -> Result<Self, IdentityError> {
        Ok(Self::from_seed(crypto::derive_seed(signature)?))
    }

    /// Restore identity from stored seed bytes
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            seed,
            signing_key: SigningKey::from_bytes(&seed),
            box_keys: KeyPair::from_secret(seed),
        }
    }

    pub fn address(&self) -> Address {
        Address::from_public_key(&self.signing_key.verifying_key().to_bytes())
    }

    /// X25519 public key peers encrypt to
    pub fn public_key(&self) -> [u8; 32] {
        self.box_keys.public
    }

    pub fn public_key_b64(&self) -> String {
        crypto::encode_b64(&self.box_keys.public)
    }

    pub fn secret_key(&self) -> &[u8; 32] {
        &self.box_keys.secret
    }

    /// Seed bytes, for persisting key material locally
    pub fn seed(&self) -> &[u8; 32] {
        &self.seed
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// Verify a signature against an address (hex verifying key)
pub fn verify_signature(
    address: &Address,
    message: &[u8],
    signature: &Signature,
) -> Result<(), IdentityError> {
    let bytes: [u8; 32] = hex::decode(address.as_str())
        .map_err(|_| IdentityError::InvalidKeyBytes)?
        .try_into()
        .map_err(|_| IdentityError::InvalidKeyBytes)?;
    let verifying_key =
        VerifyingKey::from_bytes(&bytes).map_err(|_| IdentityError::InvalidKeyBytes)?;
    verifying_key
        .verify(message, signature)
        .map_err(|_| IdentityError::InvalidSignature)
}
