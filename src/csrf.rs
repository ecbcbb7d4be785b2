//! Per-session anti-forgery tokens.
//!
//! `token = base64url(HMAC-SHA256(active_key, session_id ":" user_id ":" created_at))`.
//! Tokens are stateless: validation recomputes the MAC from the session record,
//! so rotating the active key invalidates outstanding tokens.

use base64ct::{Base64UrlUnpadded, Encoding};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::{error::SecurityError, keyring::EncryptionKeyring, session::UserSession};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct CsrfTokenService {
    keyring: Arc<EncryptionKeyring>,
}

impl CsrfTokenService {
    #[must_use]
    pub fn new(keyring: Arc<EncryptionKeyring>) -> Self {
        Self { keyring }
    }

    /// # Errors
    /// Returns an error when the keyring has no active key.
    pub fn generate(&self, session: &UserSession) -> Result<String, SecurityError> {
        let mac = self.compute(session)?;
        Ok(Base64UrlUnpadded::encode_string(&mac))
    }

    /// Recomputes the expected token and compares it in constant time.
    #[must_use]
    pub fn validate(&self, token: &str, session: &UserSession) -> bool {
        let Ok(provided) = Base64UrlUnpadded::decode_vec(token.trim()) else {
            debug!("Malformed CSRF token");
            return false;
        };
        let Ok(expected) = self.compute(session) else {
            return false;
        };
        // Length is public (always 32 bytes); only the contents are compared in constant time.
        if provided.len() != expected.len() {
            return false;
        }
        expected.as_slice().ct_eq(provided.as_slice()).into()
    }

    fn compute(&self, session: &UserSession) -> Result<Vec<u8>, SecurityError> {
        let message = format!(
            "{}:{}:{}",
            session.id,
            session.user_id,
            session.created_at.timestamp_millis()
        );
        self.keyring.with_active_key(|_, key| {
            let mut mac = HmacSha256::new_from_slice(key)
                .map_err(|e| SecurityError::Internal(format!("invalid HMAC key: {e}")))?;
            mac.update(message.as_bytes());
            Ok(mac.finalize().into_bytes().to_vec())
        })?
    }
}
