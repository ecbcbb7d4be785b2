//! Live session records.
//!
//! Flow Overview:
//! 1) `create` issues an opaque random id and captures the request context (ip, user agent).
//! 2) `validate` enforces, in order: existence and absolute expiry, context binding, idle timeout.
//! 3) A context mismatch destroys the session immediately; the caller decides how to report it.
//!
//! Only this store mutates session records. Reads hand out clones.

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    sync::{PoisonError, RwLock},
};
use tracing::{debug, info, warn};

use crate::error::SecurityError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    #[default]
    Standard,
    Elevated,
    Admin,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSession {
    pub id: String,
    pub user_id: String,
    pub device_id: Option<String>,
    pub ip: String,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub mfa_verified: bool,
    pub permissions: HashSet<String>,
    pub security_level: SecurityLevel,
}

impl UserSession {
    #[must_use]
    pub fn has_permission(&self, permission: &str) -> bool {
        self.security_level == SecurityLevel::Admin || self.permissions.contains(permission)
    }
}

/// Everything needed to open a session after authentication succeeded.
#[derive(Clone, Debug, Default)]
pub struct NewSession {
    pub user_id: String,
    pub device_id: Option<String>,
    pub ip: String,
    pub user_agent: String,
    pub mfa_verified: bool,
    pub permissions: HashSet<String>,
    pub security_level: SecurityLevel,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionValidation {
    Valid(UserSession),
    Invalid {
        reason: SecurityError,
        /// `true` for normal idle expiry: the user must log in again, but
        /// nothing suspicious happened.
        require_reauth: bool,
        /// The destroyed record, when the failure was a context mismatch.
        hijacked: Option<UserSession>,
    },
}

impl SessionValidation {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    fn invalid(reason: SecurityError) -> Self {
        Self::Invalid {
            reason,
            require_reauth: false,
            hijacked: None,
        }
    }
}

#[derive(Debug)]
pub struct SessionStore {
    idle_timeout: Duration,
    lifetime: Duration,
    sessions: RwLock<HashMap<String, UserSession>>,
}

impl SessionStore {
    #[must_use]
    pub fn new(idle_timeout: Duration, lifetime: Duration) -> Self {
        Self {
            idle_timeout,
            lifetime,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Opens a session and returns a copy of the stored record.
    ///
    /// # Errors
    /// Returns an error if the OS random source fails.
    pub fn create(
        &self,
        new: NewSession,
        now: DateTime<Utc>,
    ) -> Result<UserSession, SecurityError> {
        let session = UserSession {
            id: generate_session_id()?,
            user_id: new.user_id,
            device_id: new.device_id,
            ip: new.ip,
            user_agent: new.user_agent,
            created_at: now,
            last_activity: now,
            expires_at: now
                .checked_add_signed(self.lifetime)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            mfa_verified: new.mfa_verified,
            permissions: new.permissions,
            security_level: new.security_level,
        };

        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id.clone(), session.clone());

        info!(user_id = %session.user_id, ip = %session.ip, "Session created");
        Ok(session)
    }

    /// Checks a session against the request context and refreshes its activity.
    ///
    /// The whole check runs under one write lock, so concurrent validations of
    /// the same session cannot lose an activity update.
    pub fn validate(
        &self,
        session_id: &str,
        ip: &str,
        user_agent: &str,
        now: DateTime<Utc>,
    ) -> SessionValidation {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);

        let Some(session) = sessions.get_mut(session_id) else {
            return SessionValidation::invalid(SecurityError::SessionNotFound);
        };

        if now >= session.expires_at {
            sessions.remove(session_id);
            debug!("Session past absolute expiry removed");
            return SessionValidation::invalid(SecurityError::SessionExpired);
        }

        if session.ip != ip || session.user_agent != user_agent {
            let hijacked = sessions.remove(session_id);
            warn!(
                expected_ip = ?hijacked.as_ref().map(|s| s.ip.as_str()),
                ip,
                "Session context mismatch; session destroyed"
            );
            return SessionValidation::Invalid {
                reason: SecurityError::SessionHijackDetected,
                require_reauth: false,
                hijacked,
            };
        }

        if now.signed_duration_since(session.last_activity) >= self.idle_timeout {
            sessions.remove(session_id);
            debug!("Idle session removed");
            return SessionValidation::Invalid {
                reason: SecurityError::SessionExpired,
                require_reauth: true,
                hijacked: None,
            };
        }

        session.last_activity = session.last_activity.max(now);
        SessionValidation::Valid(session.clone())
    }

    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<UserSession> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    pub fn invalidate(&self, session_id: &str) -> Option<UserSession> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id)
    }

    /// Destroys every session owned by `user_id`.
    pub fn invalidate_user(&self, user_id: &str) -> usize {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|_, session| session.user_id != user_id);
        before - sessions.len()
    }

    /// Removes every session past its absolute expiry.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|_, session| now < session.expires_at);
        before - sessions.len()
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Create a new session id: 32 random bytes, URL-safe base64.
fn generate_session_id() -> Result<String, SecurityError> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| SecurityError::Internal(format!("failed to generate session id: {e}")))?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP: &str = "10.0.0.1";
    const UA: &str = "Mozilla/5.0";

    fn store() -> SessionStore {
        SessionStore::new(Duration::minutes(30), Duration::hours(24))
    }

    fn new_session() -> NewSession {
        NewSession {
            user_id: "user-1".to_string(),
            device_id: Some("laptop".to_string()),
            ip: IP.to_string(),
            user_agent: UA.to_string(),
            mfa_verified: true,
            permissions: HashSet::from(["mail:read".to_string()]),
            security_level: SecurityLevel::Standard,
        }
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn session_ids_are_unique_and_opaque() {
        let store = store();
        let now = Utc::now();
        let a = store.create(new_session(), now).unwrap();
        let b = store.create(new_session(), now).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(Base64UrlUnpadded::decode_vec(&a.id).unwrap().len(), 32);
        assert_eq!(store.active_count(), 2);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn idle_expiry_requires_reauth() {
        let store = store();
        let start = Utc::now();
        let session = store.create(new_session(), start).unwrap();

        let at_29 = store.validate(&session.id, IP, UA, start + Duration::minutes(29));
        assert!(at_29.is_valid());

        // 31 minutes after the activity recorded at T+29.
        let result = store.validate(&session.id, IP, UA, start + Duration::minutes(60));
        assert_eq!(
            result,
            SessionValidation::Invalid {
                reason: SecurityError::SessionExpired,
                require_reauth: true,
                hijacked: None,
            }
        );
        assert!(store.get(&session.id).is_none());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn idle_without_activity_expires_at_31_minutes() {
        let store = store();
        let start = Utc::now();
        let session = store.create(new_session(), start).unwrap();

        let result = store.validate(&session.id, IP, UA, start + Duration::minutes(31));
        assert!(matches!(
            result,
            SessionValidation::Invalid {
                require_reauth: true,
                ..
            }
        ));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn activity_refreshes_last_activity() {
        let store = store();
        let start = Utc::now();
        let session = store.create(new_session(), start).unwrap();

        let SessionValidation::Valid(refreshed) =
            store.validate(&session.id, IP, UA, start + Duration::minutes(20))
        else {
            panic!("expected a valid session");
        };
        assert_eq!(refreshed.last_activity, start + Duration::minutes(20));
        assert!(store
            .validate(&session.id, IP, UA, start + Duration::minutes(45))
            .is_valid());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[allow(clippy::unwrap_used)]
    async fn concurrent_validations_keep_latest_activity() {
        let store = std::sync::Arc::new(store());
        let start = Utc::now();
        let session = store.create(new_session(), start).unwrap();

        let handles: Vec<_> = (1..=64)
            .map(|second| {
                let store = std::sync::Arc::clone(&store);
                let id = session.id.clone();
                tokio::spawn(async move {
                    store.validate(&id, IP, UA, start + Duration::seconds(second))
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap().is_valid());
        }
        assert_eq!(
            store.get(&session.id).unwrap().last_activity,
            start + Duration::seconds(64)
        );
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn context_mismatch_destroys_session() {
        let store = store();
        let now = Utc::now();
        let session = store.create(new_session(), now).unwrap();

        let result = store.validate(&session.id, "203.0.113.9", UA, now);
        let SessionValidation::Invalid {
            reason, hijacked, ..
        } = result
        else {
            panic!("expected hijack detection");
        };
        assert_eq!(reason, SecurityError::SessionHijackDetected);
        assert_eq!(hijacked.map(|s| s.id), Some(session.id.clone()));
        assert!(store.get(&session.id).is_none());

        let other = store.create(new_session(), now).unwrap();
        assert!(!store.validate(&other.id, IP, "curl/8.0", now).is_valid());
        assert_eq!(store.active_count(), 0);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn absolute_expiry_and_sweep() {
        let store = SessionStore::new(Duration::minutes(30), Duration::hours(1));
        let now = Utc::now();
        let session = store.create(new_session(), now).unwrap();
        store.create(new_session(), now + Duration::minutes(30)).unwrap();

        assert_eq!(store.sweep_expired(now + Duration::minutes(61)), 1);
        assert_eq!(
            store.validate(&session.id, IP, UA, now + Duration::minutes(61)),
            SessionValidation::Invalid {
                reason: SecurityError::SessionNotFound,
                require_reauth: false,
                hijacked: None,
            }
        );
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn invalidate_user_removes_all_of_their_sessions() {
        let store = store();
        let now = Utc::now();
        store.create(new_session(), now).unwrap();
        store.create(new_session(), now).unwrap();
        let mut other = new_session();
        other.user_id = "user-2".to_string();
        store.create(other, now).unwrap();

        assert_eq!(store.invalidate_user("user-1"), 2);
        assert_eq!(store.active_count(), 1);
    }

    #[test]
    fn admin_level_bypasses_permissions() {
        let mut session = UserSession {
            id: "s".to_string(),
            user_id: "u".to_string(),
            device_id: None,
            ip: IP.to_string(),
            user_agent: UA.to_string(),
            created_at: Utc::now(),
            last_activity: Utc::now(),
            expires_at: Utc::now(),
            mfa_verified: false,
            permissions: HashSet::new(),
            security_level: SecurityLevel::Standard,
        };
        assert!(!session.has_permission("calendar:write"));
        session.security_level = SecurityLevel::Admin;
        assert!(session.has_permission("calendar:write"));
    }
}
