//! In-process keyring.
//!
//! Data keys are AES-256-GCM, versioned, and rotatable. Author keys are
//! Ed25519 pairs generated on first use and kept for the life of the process.

use super::{AuthorSignature, KeyError, KeyHandle, KeyManagement, SealedBox};
use aes_gcm::aead::{AeadCore, AeadInPlace, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use parking_lot::{Mutex, RwLock};
use ring::rand::SystemRandom;
use ring::signature::{self, Ed25519KeyPair, KeyPair, UnparsedPublicKey};
use std::collections::{BTreeMap, HashMap};

/// AES-GCM nonce size (96 bits).
const NONCE_SIZE: usize = 12;

/// AES-GCM tag size (128 bits).
const TAG_SIZE: usize = 16;

struct DataKey {
    key_id: String,
    cipher: Aes256Gcm,
}

struct KeyringState {
    keys: BTreeMap<u32, DataKey>,
    active: u32,
}

pub struct LocalKeyring {
    state: RwLock<KeyringState>,
    signers: Mutex<HashMap<String, Ed25519KeyPair>>,
    rng: SystemRandom,
}

impl LocalKeyring {
    /// Create a keyring with one freshly generated data key (version 1).
    pub fn generate() -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(1, fresh_data_key());
        Self {
            state: RwLock::new(KeyringState { keys, active: 1 }),
            signers: Mutex::new(HashMap::new()),
            rng: SystemRandom::new(),
        }
    }

    /// Create a keyring from existing 256-bit data keys, newest version active.
    pub fn from_keys(keys: impl IntoIterator<Item = (u32, String, [u8; 32])>) -> Result<Self, KeyError> {
        let mut map = BTreeMap::new();
        for (version, key_id, raw) in keys {
            let cipher = Aes256Gcm::new_from_slice(&raw)
                .map_err(|e| KeyError::Unavailable(format!("AES cipher init failed: {e}")))?;
            map.insert(version, DataKey { key_id, cipher });
        }
        let active = *map
            .keys()
            .next_back()
            .ok_or_else(|| KeyError::Unavailable("keyring has no data keys".into()))?;
        Ok(Self {
            state: RwLock::new(KeyringState { keys: map, active }),
            signers: Mutex::new(HashMap::new()),
            rng: SystemRandom::new(),
        })
    }

    /// Generate a new data key and make it active. Older versions stay readable.
    pub fn rotate(&self) -> KeyHandle {
        let mut state = self.state.write();
        let version = state.active + 1;
        let key = fresh_data_key();
        let handle = KeyHandle {
            version,
            key_id: key.key_id.clone(),
        };
        state.keys.insert(version, key);
        state.active = version;
        tracing::info!(version, key_id = %handle.key_id, "Rotated ledger data key");
        handle
    }

    /// Destroy a non-active data key. Payloads sealed under it become unreadable.
    pub fn retire(&self, version: u32) -> bool {
        let mut state = self.state.write();
        if version == state.active {
            return false;
        }
        let removed = state.keys.remove(&version).is_some();
        if removed {
            tracing::warn!(version, "Retired ledger data key");
        }
        removed
    }

    pub fn versions(&self) -> Vec<u32> {
        self.state.read().keys.keys().copied().collect()
    }

    fn with_cipher<T>(
        &self,
        key: &KeyHandle,
        f: impl FnOnce(&Aes256Gcm) -> Result<T, KeyError>,
    ) -> Result<T, KeyError> {
        let state = self.state.read();
        match state.keys.get(&key.version) {
            Some(data_key) if data_key.key_id == key.key_id => f(&data_key.cipher),
            _ => Err(KeyError::UnknownKey {
                version: key.version,
                key_id: key.key_id.clone(),
            }),
        }
    }
}

impl KeyManagement for LocalKeyring {
    fn active_key(&self) -> Result<KeyHandle, KeyError> {
        let state = self.state.read();
        let key = state
            .keys
            .get(&state.active)
            .ok_or_else(|| KeyError::Unavailable("active key missing".into()))?;
        Ok(KeyHandle {
            version: state.active,
            key_id: key.key_id.clone(),
        })
    }

    fn encrypt(&self, key: &KeyHandle, plaintext: &[u8], aad: &[u8]) -> Result<SealedBox, KeyError> {
        self.with_cipher(key, |cipher| {
            let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
            let mut buffer = plaintext.to_vec();
            let tag = cipher
                .encrypt_in_place_detached(&nonce, aad, &mut buffer)
                .map_err(|e| KeyError::Unavailable(format!("AES encryption failed: {e}")))?;
            Ok(SealedBox {
                ciphertext: buffer,
                nonce: nonce.to_vec(),
                tag: tag.to_vec(),
            })
        })
    }

    fn decrypt(&self, key: &KeyHandle, sealed: &SealedBox, aad: &[u8]) -> Result<Vec<u8>, KeyError> {
        if sealed.nonce.len() != NONCE_SIZE || sealed.tag.len() != TAG_SIZE {
            return Err(KeyError::Authentication);
        }
        self.with_cipher(key, |cipher| {
            let mut buffer = sealed.ciphertext.clone();
            cipher
                .decrypt_in_place_detached(
                    Nonce::from_slice(&sealed.nonce),
                    aad,
                    &mut buffer,
                    Tag::from_slice(&sealed.tag),
                )
                .map_err(|_| KeyError::Authentication)?;
            Ok(buffer)
        })
    }

    fn sign(&self, signer_id: &str, message: &[u8]) -> Result<AuthorSignature, KeyError> {
        let mut signers = self.signers.lock();
        if !signers.contains_key(signer_id) {
            let pkcs8 = Ed25519KeyPair::generate_pkcs8(&self.rng)
                .map_err(|_| KeyError::Signing("Ed25519 key generation failed".into()))?;
            let pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref())
                .map_err(|e| KeyError::Signing(format!("Ed25519 key rejected: {e}")))?;
            signers.insert(signer_id.to_string(), pair);
        }
        let pair = signers
            .get(signer_id)
            .ok_or_else(|| KeyError::Signing(format!("no signing key for {signer_id}")))?;
        Ok(AuthorSignature {
            signature: pair.sign(message).as_ref().to_vec(),
            public_key: pair.public_key().as_ref().to_vec(),
        })
    }

    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
        UnparsedPublicKey::new(&signature::ED25519, public_key)
            .verify(message, signature)
            .is_ok()
    }
}

fn fresh_data_key() -> DataKey {
    let key = Aes256Gcm::generate_key(OsRng);
    DataKey {
        key_id: format!("local-{}", uuid::Uuid::new_v4()),
        cipher: Aes256Gcm::new(&key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let keyring = LocalKeyring::generate();
        let key = keyring.active_key().unwrap();
        let sealed = keyring.encrypt(&key, "솔직한 자기평가 🦀".as_bytes(), b"ctx").unwrap();
        assert_eq!(sealed.nonce.len(), NONCE_SIZE);
        assert_eq!(sealed.tag.len(), TAG_SIZE);
        let plain = keyring.decrypt(&key, &sealed, b"ctx").unwrap();
        assert_eq!(plain, "솔직한 자기평가 🦀".as_bytes());
    }

    #[test]
    fn wrong_aad_fails_authentication() {
        let keyring = LocalKeyring::generate();
        let key = keyring.active_key().unwrap();
        let sealed = keyring.encrypt(&key, b"secret", b"override").unwrap();
        assert_eq!(
            keyring.decrypt(&key, &sealed, b"final_comment").unwrap_err(),
            KeyError::Authentication
        );
    }

    #[test]
    fn flipped_tag_fails_authentication() {
        let keyring = LocalKeyring::generate();
        let key = keyring.active_key().unwrap();
        let mut sealed = keyring.encrypt(&key, b"secret", b"").unwrap();
        sealed.tag[0] ^= 0x01;
        assert_eq!(keyring.decrypt(&key, &sealed, b"").unwrap_err(), KeyError::Authentication);
    }

    #[test]
    fn rotation_keeps_old_versions_readable() {
        let keyring = LocalKeyring::generate();
        let old = keyring.active_key().unwrap();
        let sealed = keyring.encrypt(&old, b"before rotation", b"").unwrap();

        let new = keyring.rotate();
        assert_eq!(new.version, 2);
        assert_eq!(keyring.active_key().unwrap(), new);
        assert_eq!(keyring.decrypt(&old, &sealed, b"").unwrap(), b"before rotation");
    }

    #[test]
    fn retired_key_cannot_be_resolved() {
        let keyring = LocalKeyring::generate();
        let old = keyring.active_key().unwrap();
        let sealed = keyring.encrypt(&old, b"gone", b"").unwrap();
        keyring.rotate();

        assert!(keyring.retire(old.version));
        assert!(matches!(
            keyring.decrypt(&old, &sealed, b""),
            Err(KeyError::UnknownKey { version: 1, .. })
        ));
    }

    #[test]
    fn active_key_cannot_be_retired() {
        let keyring = LocalKeyring::generate();
        assert!(!keyring.retire(1));
        assert_eq!(keyring.versions(), vec![1]);
    }

    #[test]
    fn signatures_verify_only_for_original_message() {
        let keyring = LocalKeyring::generate();
        let signed = keyring.sign("rev-1", b"ciphertext").unwrap();
        assert!(keyring.verify(&signed.public_key, b"ciphertext", &signed.signature));
        assert!(!keyring.verify(&signed.public_key, b"ciphertexT", &signed.signature));
    }

    #[test]
    fn each_author_gets_a_stable_key() {
        let keyring = LocalKeyring::generate();
        let a1 = keyring.sign("alice", b"x").unwrap();
        let a2 = keyring.sign("alice", b"y").unwrap();
        let b = keyring.sign("bob", b"x").unwrap();
        assert_eq!(a1.public_key, a2.public_key);
        assert_ne!(a1.public_key, b.public_key);
    }

    #[test]
    fn from_keys_activates_newest_version() {
        let keyring = LocalKeyring::from_keys([
            (1, "k1".to_string(), [1u8; 32]),
            (4, "k4".to_string(), [4u8; 32]),
        ])
        .unwrap();
        assert_eq!(
            keyring.active_key().unwrap(),
            KeyHandle { version: 4, key_id: "k4".into() }
        );
        assert!(LocalKeyring::from_keys(Vec::new()).is_err());
    }
}
