//! `SecurityManager`: the public facade over every security component.
//!
//! Flow Overview:
//! 1) Construction validates the config, bootstraps the keyring and wires the
//!    shared stores into the login flow.
//! 2) Request-path calls (login, session validation, CSRF, permissions) run
//!    synchronously against the in-memory stores; encryption runs on the
//!    blocking pool.
//! 3) `start_background_tasks` runs the periodic sweeps, the threat analysis
//!    and the rotation scheduler until `BackgroundTasks::shutdown`.
//!
//! Share one instance behind an `Arc`; there is no global state.

use secrecy::zeroize::Zeroize;
use serde::Serialize;
use serde_json::{json, Value};
use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    audit::{AuditLogger, AuditRecord, AuditResult, SecurityAuditLog},
    auth::{
        AuthDeps, AuthOutcome, AuthenticationFlow, CredentialVerifier, LoginRequest, MfaVerifier,
    },
    clock::{Clock, SystemClock},
    config::SecurityConfig,
    csrf::CsrfTokenService,
    error::SecurityError,
    events::{EventContext, SecurityEvent, SecurityEventType, Severity},
    keyring::{EncryptedPayload, EncryptionKeyring, KeyInfo},
    lockout::LockoutGuard,
    rate_limit::{FixedWindowRateLimiter, RateLimiter},
    sanitize,
    session::{SessionStore, SessionValidation, UserSession},
    threat::{AnalysisReport, ThreatDetector, ThreatLevel},
};

const DASHBOARD_EVENT_LIMIT: usize = 50;
const DASHBOARD_AUDIT_LIMIT: usize = 100;
const KEY_ROTATION_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Read-only snapshot for monitoring UIs.
#[derive(Clone, Debug, Serialize)]
pub struct SecurityDashboard {
    pub active_sessions: usize,
    pub recent_events: Vec<SecurityEvent>,
    pub audit_logs: Vec<SecurityAuditLog>,
    pub threat_level: ThreatLevel,
    pub blocked_ip_count: usize,
    pub active_key_id: Option<Uuid>,
    pub key_count: usize,
}

pub struct SecurityManager {
    config: SecurityConfig,
    clock: Arc<dyn Clock>,
    keyring: Arc<EncryptionKeyring>,
    sessions: Arc<SessionStore>,
    rate_limiter: Arc<dyn RateLimiter>,
    lockout: Arc<LockoutGuard>,
    csrf: CsrfTokenService,
    audit: Arc<AuditLogger>,
    threats: Arc<ThreatDetector>,
    auth: AuthenticationFlow,
}

impl fmt::Debug for SecurityManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityManager")
            .field("config", &self.config)
            .field("keyring", &self.keyring)
            .finish_non_exhaustive()
    }
}

impl SecurityManager {
    /// # Errors
    /// Returns an error if the config is invalid or the first key cannot be generated.
    pub fn new(
        config: SecurityConfig,
        credentials: Arc<dyn CredentialVerifier>,
        mfa: Arc<dyn MfaVerifier>,
    ) -> Result<Self, SecurityError> {
        Self::with_clock(config, Arc::new(SystemClock), credentials, mfa)
    }

    /// Same as [`SecurityManager::new`] with an explicit time source.
    ///
    /// # Errors
    /// Returns an error if the config is invalid or the first key cannot be generated.
    pub fn with_clock(
        config: SecurityConfig,
        clock: Arc<dyn Clock>,
        credentials: Arc<dyn CredentialVerifier>,
        mfa: Arc<dyn MfaVerifier>,
    ) -> Result<Self, SecurityError> {
        config.validate()?;
        let now = clock.now();

        let keyring = Arc::new(EncryptionKeyring::bootstrap(
            config.encryption.algorithm,
            config.encryption.key_rotation_interval(),
            now,
        )?);
        let sessions = Arc::new(SessionStore::new(
            config.authentication.session_timeout(),
            config.authentication.session_lifetime(),
        ));
        let rate_limiter: Arc<dyn RateLimiter> = Arc::new(FixedWindowRateLimiter::new(
            config.rate_limit.window(),
            config.rate_limit.max_requests,
        ));
        let lockout = Arc::new(LockoutGuard::new(
            config.authentication.max_login_attempts,
            config.authentication.lockout_duration(),
        ));
        let audit = Arc::new(AuditLogger::new(
            config.audit.enabled,
            config.audit.max_entries,
            config.audit.retain_entries,
        ));
        let threats = Arc::new(ThreatDetector::new(
            sessions.clone(),
            config.monitoring.suspicious_activity_threshold,
            config.audit.max_events,
            config.audit.retain_events,
        ));
        let auth = AuthenticationFlow::new(
            config.authentication.require_mfa,
            AuthDeps {
                clock: clock.clone(),
                rate_limiter: rate_limiter.clone(),
                lockout: lockout.clone(),
                sessions: sessions.clone(),
                threats: threats.clone(),
                audit: audit.clone(),
            },
            credentials,
            mfa,
        );

        info!(
            algorithm = %config.encryption.algorithm,
            require_mfa = config.authentication.require_mfa,
            "Security manager initialized"
        );

        Ok(Self {
            csrf: CsrfTokenService::new(keyring.clone()),
            config,
            clock,
            keyring,
            sessions,
            rate_limiter,
            lockout,
            audit,
            threats,
            auth,
        })
    }

    #[must_use]
    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    pub async fn authenticate_user(&self, request: LoginRequest) -> AuthOutcome {
        self.auth.authenticate(request).await
    }

    /// Validates a session against the request context. A context mismatch is
    /// reported as a critical `session_hijack` event before this returns.
    #[instrument(skip(self, session_id, user_agent), fields(ip = %ip))]
    pub fn validate_session(
        &self,
        session_id: &str,
        ip: &str,
        user_agent: &str,
    ) -> SessionValidation {
        let now = self.clock.now();
        let result = self.sessions.validate(session_id, ip, user_agent, now);

        if let SessionValidation::Invalid {
            reason: SecurityError::SessionHijackDetected,
            hijacked: Some(session),
            ..
        } = &result
        {
            self.threats.log_event(
                SecurityEventType::SessionHijack,
                Severity::Critical,
                EventContext::ip(ip)
                    .with_user(&session.user_id)
                    .with_session(&session.id)
                    .with_user_agent(user_agent),
                json!({
                    "expected_ip": session.ip,
                    "ip_mismatch": session.ip != ip,
                    "user_agent_mismatch": session.user_agent != user_agent,
                }),
                now,
            );
            self.audit.record(
                AuditRecord::new("validate_session", "session", AuditResult::Blocked)
                    .with_user(Some(session.user_id.clone()))
                    .with_context(Some(ip.to_string()), Some(user_agent.to_string()))
                    .with_details(json!({ "reason": "session_hijack" })),
                now,
            );
        }
        result
    }

    /// Explicit logout. Returns `false` when the session did not exist.
    pub fn logout(&self, session_id: &str) -> bool {
        let Some(session) = self.sessions.invalidate(session_id) else {
            return false;
        };
        self.audit.record(
            AuditRecord::new("logout", "session", AuditResult::Success)
                .with_user(Some(session.user_id))
                .with_context(Some(session.ip), Some(session.user_agent)),
            self.clock.now(),
        );
        true
    }

    /// Destroys every session of `user_id`, e.g. after a password change.
    pub fn revoke_user_sessions(&self, user_id: &str) -> usize {
        let revoked = self.sessions.invalidate_user(user_id);
        if revoked > 0 {
            info!(user_id, revoked, "User sessions revoked");
            self.audit.record(
                AuditRecord::new("revoke_sessions", "session", AuditResult::Success)
                    .with_user(Some(user_id.to_string()))
                    .with_details(json!({ "revoked": revoked })),
                self.clock.now(),
            );
        }
        revoked
    }

    /// Encrypts on the blocking pool with `key_id` or the active key.
    ///
    /// # Errors
    /// `KeyNotFound` for an unknown key id, `EncryptionFailed` otherwise.
    #[instrument(skip(self, plaintext), fields(len = plaintext.len()))]
    pub async fn encrypt_data(
        &self,
        plaintext: &[u8],
        key_id: Option<Uuid>,
    ) -> Result<EncryptedPayload, SecurityError> {
        let keyring = self.keyring.clone();
        let mut plaintext = plaintext.to_vec();
        tokio::task::spawn_blocking(move || {
            let result = keyring.encrypt(&plaintext, key_id);
            plaintext.as_mut_slice().zeroize();
            result
        })
        .await
        .map_err(|e| SecurityError::Internal(format!("encryption task failed: {e}")))?
    }

    /// Decrypts on the blocking pool. Failures are audited and returned; never partial output.
    ///
    /// # Errors
    /// `DecryptionFailed` when the key is unknown or authentication fails.
    #[instrument(skip(self, payload), fields(key_id = %payload.key_id))]
    pub async fn decrypt_data(&self, payload: &EncryptedPayload) -> Result<Vec<u8>, SecurityError> {
        let keyring = self.keyring.clone();
        let owned = payload.clone();
        let result = tokio::task::spawn_blocking(move || keyring.decrypt(&owned))
            .await
            .map_err(|e| SecurityError::Internal(format!("decryption task failed: {e}")))?;

        if let Err(err) = &result {
            let now = self.clock.now();
            self.threats.log_event(
                SecurityEventType::DecryptionFailure,
                Severity::Medium,
                EventContext::default(),
                json!({ "key_id": payload.key_id }),
                now,
            );
            self.audit.record(
                AuditRecord::new("decrypt", "encrypted_field", AuditResult::Failure)
                    .with_details(json!({ "key_id": payload.key_id, "error": err.to_string() })),
                now,
            );
        }
        result
    }

    /// On-demand key rotation. Earlier keys stay available for decryption.
    ///
    /// # Errors
    /// Returns an error if the OS random source fails.
    pub fn rotate_keys(&self) -> Result<Uuid, SecurityError> {
        let now = self.clock.now();
        let key_id = self.keyring.rotate(now)?;
        self.audit.record(
            AuditRecord::new("rotate_key", "keyring", AuditResult::Success)
                .with_details(json!({ "key_id": key_id, "scheduled": false })),
            now,
        );
        Ok(key_id)
    }

    /// Rotates when the active key is past its rotation interval.
    ///
    /// # Errors
    /// Returns an error if the OS random source fails.
    pub fn rotate_keys_if_due(&self) -> Result<Option<Uuid>, SecurityError> {
        let now = self.clock.now();
        let rotated = self.keyring.rotate_if_due(now)?;
        if let Some(key_id) = rotated {
            self.audit.record(
                AuditRecord::new("rotate_key", "keyring", AuditResult::Success)
                    .with_details(json!({ "key_id": key_id, "scheduled": true })),
                now,
            );
        }
        Ok(rotated)
    }

    #[must_use]
    pub fn keys(&self) -> Vec<KeyInfo> {
        self.keyring.keys()
    }

    /// # Errors
    /// `SessionNotFound` for an unknown session id.
    pub fn generate_csrf_token(&self, session_id: &str) -> Result<String, SecurityError> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or(SecurityError::SessionNotFound)?;
        self.csrf.generate(&session)
    }

    /// Constant-time check of `token` against `session_id`. Failures are logged
    /// as `csrf_violation` events.
    pub fn validate_csrf_token(&self, token: &str, session_id: &str) -> bool {
        let session = self.sessions.get(session_id);
        let valid = session
            .as_ref()
            .is_some_and(|session| self.csrf.validate(token, session));
        if !valid {
            let context = session.map_or_else(EventContext::default, |session| {
                EventContext::ip(&session.ip)
                    .with_user(&session.user_id)
                    .with_session(&session.id)
                    .with_user_agent(&session.user_agent)
            });
            self.threats.log_event(
                SecurityEventType::CsrfViolation,
                Severity::High,
                context,
                json!({ "reason": SecurityError::CsrfValidationFailed.to_string() }),
                self.clock.now(),
            );
        }
        valid
    }

    /// Admin sessions pass every check.
    pub fn check_permission(&self, session_id: &str, permission: &str) -> bool {
        self.require_permission(session_id, permission).is_ok()
    }

    /// Like [`Self::check_permission`], returning the session on success.
    ///
    /// # Errors
    /// Returns `SessionNotFound` for an unknown session and `PermissionDenied`
    /// when the session lacks `permission`.
    pub fn require_permission(
        &self,
        session_id: &str,
        permission: &str,
    ) -> Result<UserSession, SecurityError> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or(SecurityError::SessionNotFound)?;
        if session.has_permission(permission) {
            return Ok(session);
        }

        debug!(permission, "Permission denied");
        self.threats.log_event(
            SecurityEventType::PermissionDenied,
            Severity::Medium,
            EventContext::ip(&session.ip)
                .with_user(&session.user_id)
                .with_session(&session.id)
                .with_user_agent(&session.user_agent),
            json!({ "permission": permission }),
            self.clock.now(),
        );
        Err(SecurityError::PermissionDenied(permission.to_string()))
    }

    /// Best-effort audit entry. User and request context are taken from the session when given.
    pub fn audit_log(
        &self,
        action: &str,
        resource: &str,
        result: AuditResult,
        details: Value,
        session_id: Option<&str>,
    ) -> Option<Uuid> {
        let mut record = AuditRecord::new(action, resource, result);
        let mut details = details;
        if let Some(session) = session_id.and_then(|id| self.sessions.get(id)) {
            if let Value::Object(map) = &mut details {
                map.insert("session_id".to_string(), Value::String(session.id.clone()));
            }
            record = record
                .with_user(Some(session.user_id))
                .with_context(Some(session.ip), Some(session.user_agent));
        }
        self.audit.record(record.with_details(details), self.clock.now())
    }

    /// Records a security event. Critical events are remediated before this returns.
    pub fn log_security_event(
        &self,
        event_type: SecurityEventType,
        severity: Severity,
        context: EventContext,
        details: Value,
    ) -> SecurityEvent {
        self.threats
            .log_event(event_type, severity, context, details, self.clock.now())
    }

    pub fn detect_suspicious_activity(&self, user_id: &str, activity: &str) -> bool {
        self.threats
            .detect_suspicious_activity(user_id, activity, self.clock.now())
    }

    pub fn resolve_event(&self, event_id: Uuid) -> bool {
        self.threats.resolve_event(event_id)
    }

    pub fn block_ip(&self, ip: &str) {
        self.threats.block_ip(ip);
    }

    pub fn unblock_ip(&self, ip: &str) -> bool {
        let removed = self.threats.unblock_ip(ip);
        if removed {
            self.audit.record(
                AuditRecord::new("unblock_ip", "ip", AuditResult::Success)
                    .with_context(Some(ip.to_string()), None),
                self.clock.now(),
            );
        }
        removed
    }

    #[must_use]
    pub fn is_blocked(&self, ip: &str) -> bool {
        self.threats.is_blocked(ip)
    }

    #[must_use]
    pub fn sanitize_input(&self, input: &str, allow_html: bool) -> String {
        sanitize::sanitize_input(input, allow_html)
    }

    #[must_use]
    pub fn security_headers(&self) -> [(&'static str, &'static str); 4] {
        sanitize::security_headers()
    }

    #[must_use]
    pub fn get_security_dashboard(&self) -> SecurityDashboard {
        SecurityDashboard {
            active_sessions: self.sessions.active_count(),
            recent_events: self.threats.recent_events(DASHBOARD_EVENT_LIMIT),
            audit_logs: self.audit.recent(DASHBOARD_AUDIT_LIMIT),
            threat_level: self.threats.threat_level(),
            blocked_ip_count: self.threats.blocked_count(),
            active_key_id: self.keyring.active_key_id(),
            key_count: self.keyring.keys().len(),
        }
    }

    /// Drops sessions past their absolute expiry.
    pub fn sweep_sessions(&self) -> usize {
        let removed = self.sessions.sweep_expired(self.clock.now());
        if removed > 0 {
            debug!(removed, "Expired sessions swept");
        }
        removed
    }

    /// One analysis pass: block abusive IPs, recompute the threat level and
    /// forget stale rate-limit and lockout records.
    pub fn run_threat_analysis(&self) -> AnalysisReport {
        let now = self.clock.now();
        let report = self.threats.analyze(now);
        let windows = self.rate_limiter.sweep(now);
        let lockouts = self.lockout.sweep(now);
        debug!(
            blocked = report.newly_blocked.len(),
            threat_level = %report.threat_level,
            windows,
            lockouts,
            "Threat analysis pass finished"
        );
        report
    }

    /// Spawns the periodic maintenance tasks on the current tokio runtime.
    #[must_use]
    pub fn start_background_tasks(self: &Arc<Self>) -> BackgroundTasks {
        let (stop_tx, stop_rx) = watch::channel(false);
        let monitoring = &self.config.monitoring;

        let manager = Arc::clone(self);
        let sweeper = spawn_periodic(
            "session_sweep",
            Duration::from_secs(monitoring.session_sweep_interval_secs),
            stop_rx.clone(),
            move || {
                manager.sweep_sessions();
            },
        );

        let manager = Arc::clone(self);
        let analyzer = spawn_periodic(
            "threat_analysis",
            Duration::from_secs(monitoring.threat_analysis_interval_secs),
            stop_rx.clone(),
            move || {
                manager.run_threat_analysis();
            },
        );

        let manager = Arc::clone(self);
        let rotation = spawn_periodic(
            "key_rotation",
            KEY_ROTATION_CHECK_INTERVAL,
            stop_rx,
            move || {
                if let Err(e) = manager.rotate_keys_if_due() {
                    error!("Scheduled key rotation failed: {e}");
                }
            },
        );

        info!("Background tasks started");
        BackgroundTasks {
            stop: stop_tx,
            handles: vec![sweeper, analyzer, rotation],
        }
    }
}

/// Handle to the periodic maintenance tasks.
#[derive(Debug)]
pub struct BackgroundTasks {
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Signals every task and waits for them to finish their current tick.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {e}");
            }
        }
        info!("Background tasks stopped");
    }
}

fn spawn_periodic<F>(
    name: &'static str,
    period: Duration,
    mut stop: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so work starts one period in.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let started = Instant::now();
                    tick();
                    debug!(task = name, elapsed = ?started.elapsed(), "Tick finished");
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        debug!(task = name, "Background task stopping");
                        break;
                    }
                }
            }
        }
    })
}
