//! # Warden (Security & Session Manager)
//!
//! `warden` is an in-process security core. It authenticates users, issues and
//! validates sessions, encrypts sensitive fields at rest, protects
//! state-changing requests from forgery, rate-limits and locks out abusive
//! clients, and reacts to suspicious behavior in real time.
//!
//! ## Components
//!
//! - **Keyring:** `ChaCha20-Poly1305` keys with scheduled rotation. Rotated keys are
//!   demoted, never deleted, so older ciphertext stays decryptable.
//! - **Sessions:** bound to the `ip` and `user_agent` captured at login. Any
//!   deviation is treated as hijacking and the session is destroyed before the
//!   validation call returns.
//! - **CSRF:** `HMAC-SHA256` tokens derived from the active key and the session record,
//!   compared in constant time.
//! - **Abuse controls:** fixed-window rate limiting and per-IP lockout are independent.
//! - **Monitoring:** a bounded event bus and audit log feed the threat detector, which
//!   blocks abusive IPs and recomputes the threat level.
//!
//! Credential and MFA verification are delegated to the caller through the
//! [`auth::CredentialVerifier`] and [`auth::MfaVerifier`] traits.

pub mod audit;
pub mod auth;
pub mod cli;
pub mod clock;
pub mod config;
pub mod csrf;
pub mod error;
pub mod events;
pub mod keyring;
pub mod lockout;
pub mod manager;
pub mod rate_limit;
pub mod sanitize;
pub mod session;
pub mod threat;

pub use config::SecurityConfig;
pub use error::SecurityError;
pub use manager::SecurityManager;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(GIT_COMMIT_HASH.len() >= 7);
    }
}
