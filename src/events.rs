//! Security event model and the automatic remediation policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    LoginAttempt,
    LoginFailure,
    BruteForce,
    RateLimitExceeded,
    SessionHijack,
    SuspiciousActivity,
    CsrfViolation,
    PermissionDenied,
    DecryptionFailure,
}

impl fmt::Display for SecurityEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::LoginAttempt => "login_attempt",
            Self::LoginFailure => "login_failure",
            Self::BruteForce => "brute_force",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::SessionHijack => "session_hijack",
            Self::SuspiciousActivity => "suspicious_activity",
            Self::CsrfViolation => "csrf_violation",
            Self::PermissionDenied => "permission_denied",
            Self::DecryptionFailure => "decryption_failure",
        };
        f.write_str(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityAction {
    LogoutUser,
    BlockIp,
}

/// Request context attached to an event.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventContext {
    pub user_id: Option<String>,
    /// Login name as typed; present before credentials resolve to a user id.
    pub username: Option<String>,
    pub session_id: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl EventContext {
    #[must_use]
    pub fn ip(ip: &str) -> Self {
        Self {
            ip: Some(ip.to_string()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    #[must_use]
    pub fn with_username(mut self, username: &str) -> Self {
        self.username = Some(username.to_string());
        self
    }

    #[must_use]
    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = Some(user_agent.to_string());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub event_type: SecurityEventType,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub session_id: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub details: Value,
    pub resolved: bool,
    pub actions: Vec<SecurityAction>,
}

/// Automatic remediation table. Only critical events trigger actions.
#[must_use]
pub fn remediation(event_type: SecurityEventType, severity: Severity) -> &'static [SecurityAction] {
    if severity != Severity::Critical {
        return &[];
    }
    match event_type {
        SecurityEventType::SessionHijack => &[SecurityAction::LogoutUser],
        SecurityEventType::BruteForce => &[SecurityAction::BlockIp],
        _ => &[],
    }
}
