//! Symmetric key lifecycle and authenticated field encryption.
//!
//! Flow Overview:
//! 1) `rotate` generates a 256-bit key, marks it active and demotes the previous one.
//! 2) `encrypt` seals with the active key (or an explicit one) under a fresh random nonce.
//!    The key id is bound into the AAD so ciphertext cannot be replayed under another key.
//! 3) `decrypt` accepts any retained key, active or demoted.
//!
//! Demoted keys are kept for as long as the keyring lives. Key material sits in
//! `SecretBox` and is zeroized when the keyring is dropped.

use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Key, Nonce, Tag,
};
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use secrecy::{zeroize::Zeroize, ExposeSecret, SecretBox};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{config::EncryptionAlgorithm, error::SecurityError};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

struct EncryptionKey {
    material: SecretBox<[u8; KEY_LEN]>,
    info: KeyInfo,
}

/// Public metadata of a key. Never includes key material.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub id: Uuid,
    pub algorithm: EncryptionAlgorithm,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
}

/// Sealed field, safe to persist. Byte fields serialize as base64.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub key_id: Uuid,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
    #[serde(with = "b64")]
    pub auth_tag: Vec<u8>,
}

#[derive(Default)]
struct KeyringState {
    keys: HashMap<Uuid, EncryptionKey>,
    active: Option<Uuid>,
}

pub struct EncryptionKeyring {
    algorithm: EncryptionAlgorithm,
    rotation_interval: Duration,
    state: RwLock<KeyringState>,
}

impl std::fmt::Debug for EncryptionKeyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKeyring")
            .field("algorithm", &self.algorithm)
            .field("rotation_interval", &self.rotation_interval)
            .finish_non_exhaustive()
    }
}

impl EncryptionKeyring {
    /// Creates an empty keyring. Call [`Self::rotate`] once before use.
    #[must_use]
    pub fn new(algorithm: EncryptionAlgorithm, rotation_interval: Duration) -> Self {
        Self {
            algorithm,
            rotation_interval,
            state: RwLock::new(KeyringState::default()),
        }
    }

    /// Creates a keyring holding one freshly generated active key.
    ///
    /// # Errors
    /// Returns an error if the OS random source fails.
    pub fn bootstrap(
        algorithm: EncryptionAlgorithm,
        rotation_interval: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self, SecurityError> {
        let keyring = Self::new(algorithm, rotation_interval);
        keyring.rotate(now)?;
        Ok(keyring)
    }

    /// Generates a new key, marks it active and demotes the previous active key.
    ///
    /// # Errors
    /// Returns an error if the OS random source fails or the lock is poisoned.
    pub fn rotate(&self, now: DateTime<Utc>) -> Result<Uuid, SecurityError> {
        let mut bytes = [0u8; KEY_LEN];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| SecurityError::Internal(format!("failed to generate key: {e}")))?;
        let material = SecretBox::new(Box::new(bytes));
        bytes.zeroize();

        let id = Uuid::new_v4();
        let key = EncryptionKey {
            material,
            info: KeyInfo {
                id,
                algorithm: self.algorithm,
                created_at: now,
                expires_at: now
                    .checked_add_signed(self.rotation_interval)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
                active: true,
            },
        };

        let mut state = self.write()?;
        let previous = state.active.take();
        if let Some(previous) = previous {
            if let Some(old) = state.keys.get_mut(&previous) {
                old.info.active = false;
            }
        }
        state.keys.insert(id, key);
        state.active = Some(id);
        let retained = state.keys.len();
        drop(state);

        info!(key_id = %id, previous_key_id = ?previous, retained, "Encryption key rotated");
        Ok(id)
    }

    /// Rotates when the active key has reached its scheduled expiry.
    ///
    /// # Errors
    /// Returns an error if rotation fails.
    pub fn rotate_if_due(&self, now: DateTime<Utc>) -> Result<Option<Uuid>, SecurityError> {
        let due = {
            let state = self.read()?;
            match state.active.and_then(|id| state.keys.get(&id)) {
                Some(key) => key.info.expires_at <= now,
                None => true,
            }
        };
        if due {
            self.rotate(now).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Seals `plaintext` with `key_id`, or the active key when `None`.
    ///
    /// # Errors
    /// Returns `KeyNotFound` for an unknown key and `EncryptionFailed` when the
    /// keyring has no active key or the cipher rejects the input.
    #[allow(deprecated)]
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        key_id: Option<Uuid>,
    ) -> Result<EncryptedPayload, SecurityError> {
        let state = self.read()?;
        let key_id = match key_id {
            Some(id) => id,
            None => state.active.ok_or(SecurityError::EncryptionFailed)?,
        };
        let key = state
            .keys
            .get(&key_id)
            .ok_or(SecurityError::KeyNotFound(key_id))?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.material.expose_secret()));
        drop(state);

        let mut iv = [0u8; NONCE_LEN];
        OsRng
            .try_fill_bytes(&mut iv)
            .map_err(|_| SecurityError::EncryptionFailed)?;

        let mut buffer = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&iv), &aad(key_id), &mut buffer)
            .map_err(|_| SecurityError::EncryptionFailed)?;

        debug!(key_id = %key_id, len = plaintext.len(), "Field encrypted");
        Ok(EncryptedPayload {
            key_id,
            ciphertext: buffer,
            iv: iv.to_vec(),
            auth_tag: tag.to_vec(),
        })
    }

    /// Opens a payload sealed under any retained key. Fails closed.
    ///
    /// # Errors
    /// Returns `DecryptionFailed` when the key is absent, the payload is malformed,
    /// or the authentication tag does not verify.
    #[allow(deprecated)]
    pub fn decrypt(&self, payload: &EncryptedPayload) -> Result<Vec<u8>, SecurityError> {
        if payload.iv.len() != NONCE_LEN || payload.auth_tag.len() != TAG_LEN {
            return Err(SecurityError::DecryptionFailed);
        }

        let cipher = {
            let state = self.read().map_err(|_| SecurityError::DecryptionFailed)?;
            let Some(key) = state.keys.get(&payload.key_id) else {
                warn!(key_id = %payload.key_id, "Decryption requested for unknown key");
                return Err(SecurityError::DecryptionFailed);
            };
            ChaCha20Poly1305::new(Key::from_slice(key.material.expose_secret()))
        };

        let mut buffer = payload.ciphertext.clone();
        match cipher.decrypt_in_place_detached(
            Nonce::from_slice(&payload.iv),
            &aad(payload.key_id),
            &mut buffer,
            Tag::from_slice(&payload.auth_tag),
        ) {
            Ok(()) => Ok(buffer),
            Err(_) => {
                buffer.zeroize();
                warn!(key_id = %payload.key_id, "Authentication tag mismatch");
                Err(SecurityError::DecryptionFailed)
            }
        }
    }

    /// Runs `f` with the active key id and material without letting the
    /// material escape the keyring.
    ///
    /// # Errors
    /// Returns `EncryptionFailed` when no key is active.
    pub fn with_active_key<R>(
        &self,
        f: impl FnOnce(Uuid, &[u8]) -> R,
    ) -> Result<R, SecurityError> {
        let state = self.read()?;
        let id = state.active.ok_or(SecurityError::EncryptionFailed)?;
        let key = state.keys.get(&id).ok_or(SecurityError::KeyNotFound(id))?;
        Ok(f(id, key.material.expose_secret()))
    }

    #[must_use]
    pub fn active_key_id(&self) -> Option<Uuid> {
        self.state.read().ok()?.active
    }

    /// Metadata of every retained key, oldest first.
    #[must_use]
    pub fn keys(&self) -> Vec<KeyInfo> {
        let Ok(state) = self.state.read() else {
            return Vec::new();
        };
        let mut keys: Vec<KeyInfo> = state.keys.values().map(|k| k.info.clone()).collect();
        keys.sort_by_key(|k| k.created_at);
        keys
    }

    #[must_use]
    pub fn algorithm(&self) -> EncryptionAlgorithm {
        self.algorithm
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, KeyringState>, SecurityError> {
        self.state
            .read()
            .map_err(|_| SecurityError::Internal("Poisoned lock".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, KeyringState>, SecurityError> {
        self.state
            .write()
            .map_err(|_| SecurityError::Internal("Poisoned lock".to_string()))
    }
}

fn aad(key_id: Uuid) -> Vec<u8> {
    format!("warden-field:v1|{key_id}").into_bytes()
}

mod b64 {
    use base64ct::{Base64, Encoding};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&Base64::encode_string(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Base64::decode_vec(&encoded).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(clippy::unwrap_used)]
    fn keyring() -> EncryptionKeyring {
        EncryptionKeyring::bootstrap(
            EncryptionAlgorithm::ChaCha20Poly1305,
            Duration::days(30),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_encrypt_decrypt_roundtrip() {
        let keyring = keyring();
        let payload = keyring.encrypt(b"my-secret-field", None).unwrap();

        assert_eq!(Some(payload.key_id), keyring.active_key_id());
        assert_ne!(payload.ciphertext, b"my-secret-field");
        assert_eq!(payload.iv.len(), NONCE_LEN);
        assert_eq!(payload.auth_tag.len(), TAG_LEN);
        assert_eq!(keyring.decrypt(&payload).unwrap(), b"my-secret-field");
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_empty_plaintext_roundtrip() {
        let keyring = keyring();
        let payload = keyring.encrypt(b"", None).unwrap();
        assert!(payload.ciphertext.is_empty());
        assert_eq!(keyring.decrypt(&payload).unwrap(), b"");
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_every_bit_flip_fails_closed() {
        let keyring = keyring();
        let payload = keyring.encrypt(b"abc", None).unwrap();

        for field in 0..2 {
            let len = if field == 0 {
                payload.ciphertext.len()
            } else {
                payload.auth_tag.len()
            };
            for byte in 0..len {
                for bit in 0..8 {
                    let mut tampered = payload.clone();
                    let target = if field == 0 {
                        &mut tampered.ciphertext
                    } else {
                        &mut tampered.auth_tag
                    };
                    if let Some(b) = target.get_mut(byte) {
                        *b ^= 1 << bit;
                    }
                    assert_eq!(
                        keyring.decrypt(&tampered),
                        Err(SecurityError::DecryptionFailed)
                    );
                }
            }
        }
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_rotation_keeps_old_keys_decryptable() {
        let keyring = keyring();
        let first = keyring.active_key_id().unwrap();
        let old = keyring.encrypt(b"before rotation", None).unwrap();

        let second = keyring.rotate(Utc::now()).unwrap();
        assert_ne!(first, second);

        let new = keyring.encrypt(b"after rotation", None).unwrap();
        assert_eq!(new.key_id, second);
        assert_eq!(keyring.decrypt(&old).unwrap(), b"before rotation");

        let keys = keyring.keys();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys.iter().filter(|k| k.active).count(), 1);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_explicit_historical_key() {
        let keyring = keyring();
        let first = keyring.active_key_id().unwrap();
        keyring.rotate(Utc::now()).unwrap();

        let payload = keyring.encrypt(b"pinned", Some(first)).unwrap();
        assert_eq!(payload.key_id, first);
        assert_eq!(keyring.decrypt(&payload).unwrap(), b"pinned");
    }

    #[test]
    fn test_unknown_key() {
        let keyring = keyring();
        let missing = Uuid::new_v4();
        assert_eq!(
            keyring.encrypt(b"x", Some(missing)),
            Err(SecurityError::KeyNotFound(missing))
        );
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_key_id_is_bound_to_ciphertext() {
        let keyring = keyring();
        let mut payload = keyring.encrypt(b"bound", None).unwrap();
        payload.key_id = keyring.rotate(Utc::now()).unwrap();
        assert_eq!(
            keyring.decrypt(&payload),
            Err(SecurityError::DecryptionFailed)
        );
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_nonces_are_fresh() {
        let keyring = keyring();
        let a = keyring.encrypt(b"same", None).unwrap();
        let b = keyring.encrypt(b"same", None).unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_rotate_if_due() {
        let start = Utc::now();
        let keyring = EncryptionKeyring::bootstrap(
            EncryptionAlgorithm::ChaCha20Poly1305,
            Duration::days(1),
            start,
        )
        .unwrap();

        assert_eq!(keyring.rotate_if_due(start + Duration::hours(23)).unwrap(), None);
        let rotated = keyring.rotate_if_due(start + Duration::days(1)).unwrap();
        assert!(rotated.is_some());
        assert_eq!(keyring.active_key_id(), rotated);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_payload_serializes_as_base64() {
        let keyring = keyring();
        let payload = keyring.encrypt(b"persist me", None).unwrap();
        let json = serde_json::to_string(&payload).unwrap();
        let restored: EncryptedPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(keyring.decrypt(&restored).unwrap(), b"persist me");
    }

    #[test]
    fn test_empty_keyring_cannot_encrypt() {
        let keyring =
            EncryptionKeyring::new(EncryptionAlgorithm::ChaCha20Poly1305, Duration::days(1));
        assert_eq!(
            keyring.encrypt(b"x", None),
            Err(SecurityError::EncryptionFailed)
        );
    }
}
