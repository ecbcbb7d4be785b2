//! End-to-end login sequence.
//!
//! Flow Overview:
//! 1) Blocked IPs are rejected outright.
//! 2) The request is counted against the per-IP rate limit.
//! 3) An IP inside its lockout window is rejected, even with correct credentials.
//! 4) Credentials are checked by the external verifier; failures count toward lockout.
//! 5) With MFA required and no token supplied, the flow stops at `MfaRequired`.
//! 6) A supplied MFA token is checked by the external verifier; failures count toward lockout.
//! 7) A session is opened and the failure counter for the IP is cleared.
//!
//! Every rejection emits a security event and an audit entry. The credential
//! failure is identical whether the user or the password was wrong.

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::HashSet, fmt, sync::Arc};
use tracing::{debug, instrument};

use crate::{
    audit::{AuditLogger, AuditRecord, AuditResult},
    clock::Clock,
    error::SecurityError,
    events::{EventContext, SecurityEventType, Severity},
    lockout::LockoutGuard,
    rate_limit::{RateLimitDecision, RateLimiter},
    session::{NewSession, SecurityLevel, SessionStore, UserSession},
    threat::ThreatDetector,
};

/// Identity returned by a successful credential check.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub id: String,
    pub permissions: HashSet<String>,
    pub security_level: SecurityLevel,
}

/// Verifies a username/password pair. Constant-time behavior is the
/// implementation's own concern.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, username: &str, password: &SecretString) -> Option<AuthenticatedUser>;
}

#[async_trait]
pub trait MfaVerifier: Send + Sync {
    async fn verify(&self, user_id: &str, token: &SecretString) -> bool;
}

/// Rejects every credential and every MFA token. Used until real verifiers are wired in.
#[derive(Clone, Copy, Debug, Default)]
pub struct DenyAllVerifier;

#[async_trait]
impl CredentialVerifier for DenyAllVerifier {
    async fn verify(&self, _username: &str, _password: &SecretString) -> Option<AuthenticatedUser> {
        None
    }
}

#[async_trait]
impl MfaVerifier for DenyAllVerifier {
    async fn verify(&self, _user_id: &str, _token: &SecretString) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub username: String,
    pub password: SecretString,
    pub mfa_token: Option<SecretString>,
    pub ip: String,
    pub user_agent: String,
    pub device_id: Option<String>,
}

impl LoginRequest {
    #[must_use]
    pub fn new(username: &str, password: &str, ip: &str, user_agent: &str) -> Self {
        Self {
            username: username.to_string(),
            password: SecretString::from(password.to_string()),
            mfa_token: None,
            ip: ip.to_string(),
            user_agent: user_agent.to_string(),
            device_id: None,
        }
    }

    #[must_use]
    pub fn with_mfa_token(mut self, token: &str) -> Self {
        self.mfa_token = Some(SecretString::from(token.to_string()));
        self
    }

    #[must_use]
    pub fn with_device_id(mut self, device_id: &str) -> Self {
        self.device_id = Some(device_id.to_string());
        self
    }
}

/// Stages of the login state machine, reported in audit details.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStage {
    BlockCheck,
    RateLimitCheck,
    LockoutCheck,
    CredentialCheck,
    MfaCheck,
    SessionCreated,
}

impl fmt::Display for AuthStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::BlockCheck => "block_check",
            Self::RateLimitCheck => "rate_limit_check",
            Self::LockoutCheck => "lockout_check",
            Self::CredentialCheck => "credential_check",
            Self::MfaCheck => "mfa_check",
            Self::SessionCreated => "session_created",
        };
        f.write_str(value)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    Success(UserSession),
    /// Credentials were valid but a second factor must be supplied. No session exists yet.
    MfaRequired { user_id: String },
    Failure(SecurityError),
}

impl AuthOutcome {
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Success(session) => Some(session.id.as_str()),
            Self::MfaRequired { .. } | Self::Failure(_) => None,
        }
    }

    /// Collapses the outcome for callers that only branch on success.
    ///
    /// # Errors
    /// Returns `MfaRequired` when a second factor is pending, otherwise the failure reason.
    pub fn into_session(self) -> Result<UserSession, SecurityError> {
        match self {
            Self::Success(session) => Ok(session),
            Self::MfaRequired { .. } => Err(SecurityError::MfaRequired),
            Self::Failure(reason) => Err(reason),
        }
    }
}

pub struct AuthenticationFlow {
    require_mfa: bool,
    clock: Arc<dyn Clock>,
    rate_limiter: Arc<dyn RateLimiter>,
    lockout: Arc<LockoutGuard>,
    sessions: Arc<SessionStore>,
    threats: Arc<ThreatDetector>,
    audit: Arc<AuditLogger>,
    credentials: Arc<dyn CredentialVerifier>,
    mfa: Arc<dyn MfaVerifier>,
}

impl fmt::Debug for AuthenticationFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationFlow")
            .field("require_mfa", &self.require_mfa)
            .finish_non_exhaustive()
    }
}

/// Shared collaborators of the login flow.
pub struct AuthDeps {
    pub clock: Arc<dyn Clock>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub lockout: Arc<LockoutGuard>,
    pub sessions: Arc<SessionStore>,
    pub threats: Arc<ThreatDetector>,
    pub audit: Arc<AuditLogger>,
}

impl AuthenticationFlow {
    #[must_use]
    pub fn new(
        require_mfa: bool,
        deps: AuthDeps,
        credentials: Arc<dyn CredentialVerifier>,
        mfa: Arc<dyn MfaVerifier>,
    ) -> Self {
        Self {
            require_mfa,
            clock: deps.clock,
            rate_limiter: deps.rate_limiter,
            lockout: deps.lockout,
            sessions: deps.sessions,
            threats: deps.threats,
            audit: deps.audit,
            credentials,
            mfa,
        }
    }

    #[instrument(skip(self, request), fields(ip = %request.ip, username = %request.username))]
    pub async fn authenticate(&self, request: LoginRequest) -> AuthOutcome {
        let now = self.clock.now();
        let context = EventContext::ip(&request.ip)
            .with_username(&request.username)
            .with_user_agent(&request.user_agent);

        // 1. Blocked set
        if self.threats.is_blocked(&request.ip) {
            self.threats.log_event(
                SecurityEventType::LoginAttempt,
                Severity::High,
                context,
                json!({ "success": false, "reason": "blocked_ip" }),
                now,
            );
            return self.fail(&request, AuthStage::BlockCheck, SecurityError::AccessDenied);
        }

        // 2. Rate limit
        if self.rate_limiter.check(&request.ip, now) == RateLimitDecision::Limited {
            self.threats.log_event(
                SecurityEventType::RateLimitExceeded,
                Severity::Medium,
                context,
                json!({ "action": "login" }),
                now,
            );
            return self.fail(
                &request,
                AuthStage::RateLimitCheck,
                SecurityError::RateLimitExceeded,
            );
        }

        // 3. Lockout
        if let Err(err) = self.lockout.check(&request.ip, now) {
            self.threats.log_event(
                SecurityEventType::BruteForce,
                Severity::High,
                context,
                json!({ "failed_attempts": self.lockout.failures(&request.ip) }),
                now,
            );
            return self.fail(&request, AuthStage::LockoutCheck, err);
        }

        // 4. Credentials
        let Some(user) = self
            .credentials
            .verify(&request.username, &request.password)
            .await
        else {
            let attempts = self.lockout.record_failure(&request.ip, now);
            self.threats.log_event(
                SecurityEventType::LoginFailure,
                Severity::Medium,
                context,
                json!({ "reason": "invalid_credentials", "failed_attempts": attempts }),
                now,
            );
            return self.fail(
                &request,
                AuthStage::CredentialCheck,
                SecurityError::InvalidCredentials,
            );
        };
        let context = context.with_user(&user.id);

        // 5-6. Second factor
        let mfa_verified = match request.mfa_token.as_ref() {
            None if self.require_mfa => {
                debug!(user_id = %user.id, "MFA token required");
                self.audit.record(
                    AuditRecord::new("login", "session", AuditResult::Failure)
                        .with_user(Some(user.id.clone()))
                        .with_context(Some(request.ip.clone()), Some(request.user_agent.clone()))
                        .with_details(json!({
                            "stage": AuthStage::MfaCheck,
                            "reason": "mfa_required",
                        })),
                    now,
                );
                return AuthOutcome::MfaRequired { user_id: user.id };
            }
            None => false,
            Some(token) => {
                if !self.mfa.verify(&user.id, token).await {
                    let attempts = self.lockout.record_failure(&request.ip, now);
                    self.threats.log_event(
                        SecurityEventType::LoginFailure,
                        Severity::Medium,
                        context,
                        json!({ "reason": "invalid_mfa_token", "failed_attempts": attempts }),
                        now,
                    );
                    return self.fail(&request, AuthStage::MfaCheck, SecurityError::InvalidMfaToken);
                }
                true
            }
        };

        // 7. Session
        let session = match self.sessions.create(
            NewSession {
                user_id: user.id.clone(),
                device_id: request.device_id.clone(),
                ip: request.ip.clone(),
                user_agent: request.user_agent.clone(),
                mfa_verified,
                permissions: user.permissions,
                security_level: user.security_level,
            },
            now,
        ) {
            Ok(session) => session,
            Err(err) => return self.fail(&request, AuthStage::SessionCreated, err),
        };
        self.lockout.record_success(&request.ip);

        self.threats.log_event(
            SecurityEventType::LoginAttempt,
            Severity::Low,
            context.with_session(&session.id),
            json!({ "success": true, "mfa_verified": mfa_verified }),
            now,
        );
        self.audit.record(
            AuditRecord::new("login", "session", AuditResult::Success)
                .with_user(Some(user.id))
                .with_context(Some(request.ip), Some(request.user_agent))
                .with_details(json!({
                    "stage": AuthStage::SessionCreated,
                    "mfa_verified": mfa_verified,
                })),
            now,
        );
        AuthOutcome::Success(session)
    }

    fn fail(&self, request: &LoginRequest, stage: AuthStage, reason: SecurityError) -> AuthOutcome {
        let result = match stage {
            AuthStage::BlockCheck | AuthStage::RateLimitCheck | AuthStage::LockoutCheck => {
                AuditResult::Blocked
            }
            AuthStage::CredentialCheck | AuthStage::MfaCheck | AuthStage::SessionCreated => {
                AuditResult::Failure
            }
        };
        debug!(%stage, %reason, "Login rejected");
        self.audit.record(
            AuditRecord::new("login", "session", result)
                .with_context(Some(request.ip.clone()), Some(request.user_agent.clone()))
                .with_details(json!({ "stage": stage, "reason": reason.to_string() })),
            self.clock.now(),
        );
        AuthOutcome::Failure(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, rate_limit::FixedWindowRateLimiter};
    use chrono::{Duration, Utc};
    use secrecy::ExposeSecret;

    struct StaticCredentials;

    #[async_trait]
    impl CredentialVerifier for StaticCredentials {
        async fn verify(
            &self,
            username: &str,
            password: &SecretString,
        ) -> Option<AuthenticatedUser> {
            (username == "alice" && password.expose_secret() == "correct horse").then(|| {
                AuthenticatedUser {
                    id: "user-alice".to_string(),
                    permissions: HashSet::from(["read".to_string()]),
                    security_level: SecurityLevel::Standard,
                }
            })
        }
    }

    struct StaticMfa;

    #[async_trait]
    impl MfaVerifier for StaticMfa {
        async fn verify(&self, _user_id: &str, token: &SecretString) -> bool {
            token.expose_secret() == "123456"
        }
    }

    struct Harness {
        clock: ManualClock,
        flow: AuthenticationFlow,
        lockout: Arc<LockoutGuard>,
        sessions: Arc<SessionStore>,
        threats: Arc<ThreatDetector>,
        audit: Arc<AuditLogger>,
    }

    fn harness(require_mfa: bool, max_requests: u32) -> Harness {
        let clock = ManualClock::new(Utc::now());
        let sessions = Arc::new(SessionStore::new(Duration::minutes(30), Duration::hours(24)));
        let threats = Arc::new(ThreatDetector::new(sessions.clone(), 10, 1_000, 500));
        let lockout = Arc::new(LockoutGuard::new(3, Duration::minutes(15)));
        let audit = Arc::new(AuditLogger::new(true, 100, 50));
        let flow = AuthenticationFlow::new(
            require_mfa,
            AuthDeps {
                clock: Arc::new(clock.clone()),
                rate_limiter: Arc::new(FixedWindowRateLimiter::new(
                    Duration::minutes(1),
                    max_requests,
                )),
                lockout: lockout.clone(),
                sessions: sessions.clone(),
                threats: threats.clone(),
                audit: audit.clone(),
            },
            Arc::new(StaticCredentials),
            Arc::new(StaticMfa),
        );
        Harness {
            clock,
            flow,
            lockout,
            sessions,
            threats,
            audit,
        }
    }

    fn login(password: &str) -> LoginRequest {
        LoginRequest::new("alice", password, "203.0.113.7", "agent/1.0")
    }

    fn last_event_type(threats: &ThreatDetector) -> Option<SecurityEventType> {
        threats.recent_events(1).first().map(|e| e.event_type)
    }

    #[tokio::test]
    async fn successful_login_opens_session() {
        let h = harness(false, 100);
        let outcome = h.flow.authenticate(login("correct horse").with_device_id("d1")).await;

        let AuthOutcome::Success(session) = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(session.user_id, "user-alice");
        assert_eq!(session.device_id.as_deref(), Some("d1"));
        assert!(!session.mfa_verified);
        assert!(session.has_permission("read"));
        assert_eq!(h.sessions.active_count(), 1);
        assert_eq!(last_event_type(&h.threats), Some(SecurityEventType::LoginAttempt));
        assert_eq!(h.audit.recent(1)[0].result, AuditResult::Success);
    }

    #[tokio::test]
    async fn wrong_password_counts_toward_lockout() {
        let h = harness(false, 100);
        let outcome = h.flow.authenticate(login("nope")).await;

        assert_eq!(outcome, AuthOutcome::Failure(SecurityError::InvalidCredentials));
        assert_eq!(h.lockout.failures("203.0.113.7"), 1);
        assert_eq!(last_event_type(&h.threats), Some(SecurityEventType::LoginFailure));
        assert_eq!(h.sessions.active_count(), 0);
    }

    #[tokio::test]
    async fn unknown_user_is_indistinguishable_from_wrong_password() {
        let h = harness(false, 100);
        let unknown = h
            .flow
            .authenticate(LoginRequest::new("mallory", "x", "203.0.113.7", "agent/1.0"))
            .await;
        let wrong = h.flow.authenticate(login("x")).await;
        assert_eq!(unknown, wrong);
    }

    #[tokio::test]
    async fn lockout_rejects_correct_credentials_until_window_passes() {
        let h = harness(false, 100);
        for _ in 0..3 {
            h.flow.authenticate(login("nope")).await;
        }

        let outcome = h.flow.authenticate(login("correct horse")).await;
        assert!(matches!(
            outcome,
            AuthOutcome::Failure(SecurityError::AccountLocked { .. })
        ));
        assert_eq!(last_event_type(&h.threats), Some(SecurityEventType::BruteForce));
        assert_eq!(h.audit.recent(1)[0].result, AuditResult::Blocked);

        h.clock.advance(Duration::minutes(15) + Duration::seconds(1));
        let outcome = h.flow.authenticate(login("correct horse")).await;
        assert!(outcome.session_id().is_some());
        assert_eq!(h.lockout.failures("203.0.113.7"), 0);
    }

    #[tokio::test]
    async fn blocked_ip_is_denied_before_anything_else() {
        let h = harness(false, 100);
        h.threats.block_ip("203.0.113.7");

        let outcome = h.flow.authenticate(login("correct horse")).await;
        assert_eq!(outcome, AuthOutcome::Failure(SecurityError::AccessDenied));
        assert_eq!(h.lockout.failures("203.0.113.7"), 0);
        let event = &h.threats.recent_events(1)[0];
        assert_eq!(event.event_type, SecurityEventType::LoginAttempt);
        assert_eq!(event.severity, Severity::High);
    }

    #[tokio::test]
    async fn rate_limit_applies_to_every_attempt() {
        let h = harness(false, 2);
        assert!(h.flow.authenticate(login("correct horse")).await.session_id().is_some());
        assert!(h.flow.authenticate(login("correct horse")).await.session_id().is_some());

        let outcome = h.flow.authenticate(login("correct horse")).await;
        assert_eq!(outcome, AuthOutcome::Failure(SecurityError::RateLimitExceeded));
        assert_eq!(
            last_event_type(&h.threats),
            Some(SecurityEventType::RateLimitExceeded)
        );

        h.clock.advance(Duration::minutes(1));
        assert!(h.flow.authenticate(login("correct horse")).await.session_id().is_some());
    }

    #[tokio::test]
    async fn mfa_required_without_token() {
        let h = harness(true, 100);
        let outcome = h.flow.authenticate(login("correct horse")).await;

        assert_eq!(
            outcome,
            AuthOutcome::MfaRequired {
                user_id: "user-alice".to_string()
            }
        );
        assert_eq!(h.sessions.active_count(), 0);
        assert_eq!(h.lockout.failures("203.0.113.7"), 0);
    }

    #[tokio::test]
    async fn mfa_token_is_verified() {
        let h = harness(true, 100);

        let outcome = h
            .flow
            .authenticate(login("correct horse").with_mfa_token("000000"))
            .await;
        assert_eq!(outcome, AuthOutcome::Failure(SecurityError::InvalidMfaToken));
        assert_eq!(h.lockout.failures("203.0.113.7"), 1);

        let outcome = h
            .flow
            .authenticate(login("correct horse").with_mfa_token("123456"))
            .await;
        let AuthOutcome::Success(session) = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert!(session.mfa_verified);
    }

    #[tokio::test]
    async fn optional_mfa_token_is_still_checked() {
        let h = harness(false, 100);
        let outcome = h
            .flow
            .authenticate(login("correct horse").with_mfa_token("bad"))
            .await;
        assert_eq!(outcome, AuthOutcome::Failure(SecurityError::InvalidMfaToken));
    }

    #[tokio::test]
    async fn deny_all_verifier_rejects_everything() {
        let password = SecretString::from("anything".to_string());
        assert!(CredentialVerifier::verify(&DenyAllVerifier, "alice", &password)
            .await
            .is_none());
        assert!(!MfaVerifier::verify(&DenyAllVerifier, "alice", &password).await);
    }
}
