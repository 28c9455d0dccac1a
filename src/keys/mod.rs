//! Key-management collaborator.
//!
//! The ledger never touches raw key material. It asks a [`KeyManagement`]
//! implementation for the active key handle, then hands plaintext and handles
//! back for encryption, decryption, signing, and verification.
//!
//! [`LocalKeyring`] is an in-process implementation (AES-256-GCM data keys,
//! Ed25519 author keys via `ring`) suitable for single-node deployments and
//! tests.

pub mod local;

pub use local::LocalKeyring;

use serde::{Deserialize, Serialize};

/// Identifies one data-encryption key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyHandle {
    pub version: u32,
    pub key_id: String,
}

/// AEAD output with the tag kept apart from the ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBox {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub tag: Vec<u8>,
}

/// Author signature plus the public half needed to check it later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorSignature {
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// No key with this version/id can be resolved (rotated out, destroyed).
    #[error("unknown key version {version} ({key_id})")]
    UnknownKey { version: u32, key_id: String },
    /// The collaborator itself failed; safe to retry.
    #[error("key service unavailable: {0}")]
    Unavailable(String),
    /// The key resolved but the payload did not authenticate.
    #[error("payload failed authentication")]
    Authentication,
    #[error("signing failed: {0}")]
    Signing(String),
}

pub trait KeyManagement: Send + Sync {
    /// Handle of the key new payloads are sealed under.
    fn active_key(&self) -> Result<KeyHandle, KeyError>;

    fn encrypt(&self, key: &KeyHandle, plaintext: &[u8], aad: &[u8]) -> Result<SealedBox, KeyError>;

    fn decrypt(&self, key: &KeyHandle, sealed: &SealedBox, aad: &[u8]) -> Result<Vec<u8>, KeyError>;

    /// Sign `message` with the asymmetric key belonging to `signer_id`.
    fn sign(&self, signer_id: &str, message: &[u8]) -> Result<AuthorSignature, KeyError>;

    /// Check `signature` over `message` against a stored public key.
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool;
}
