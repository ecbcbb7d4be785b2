//! Error taxonomy for the security core.
//!
//! Authentication and session outcomes are reported through typed result enums
//! ([`crate::auth::AuthOutcome`], [`crate::session::SessionValidation`]); the
//! variants below back those outcomes and the fallible cryptographic operations.

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecurityError {
    #[error("Encryption key not found: {0}")]
    KeyNotFound(Uuid),
    /// Absent key or failed tag verification. Never carries partial plaintext.
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("MFA token required")]
    MfaRequired,
    #[error("Invalid MFA token")]
    InvalidMfaToken,
    #[error("Account locked: {remaining_seconds}s remaining")]
    AccountLocked { remaining_seconds: u64 },
    #[error("Too many requests")]
    RateLimitExceeded,
    #[error("Access denied")]
    AccessDenied,
    #[error("Session expired")]
    SessionExpired,
    #[error("Session hijack detected")]
    SessionHijackDetected,
    #[error("Session not found")]
    SessionNotFound,
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("CSRF validation failed")]
    CsrfValidationFailed,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Unsupported encryption algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("{field}: retained size {keep} must be smaller than the trim trigger {max}")]
    Retention {
        field: &'static str,
        keep: usize,
        max: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locked_message_includes_remaining_time() {
        let err = SecurityError::AccountLocked {
            remaining_seconds: 42,
        };
        assert_eq!(err.to_string(), "Account locked: 42s remaining");
    }

    #[test]
    fn decryption_failure_is_opaque() {
        assert_eq!(SecurityError::DecryptionFailed.to_string(), "Decryption failed");
    }
}
