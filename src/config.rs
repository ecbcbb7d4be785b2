//! Security configuration, validated once at construction time.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::error::ConfigError;

const DEFAULT_KEY_ROTATION_INTERVAL_DAYS: u32 = 30;
const DEFAULT_SESSION_TIMEOUT_MINUTES: u32 = 30;
const DEFAULT_SESSION_LIFETIME_HOURS: u32 = 24;
const DEFAULT_MAX_LOGIN_ATTEMPTS: u32 = 5;
const DEFAULT_LOCKOUT_DURATION_MINUTES: u32 = 15;
const DEFAULT_RATE_LIMIT_WINDOW_MS: u64 = 60_000;
const DEFAULT_RATE_LIMIT_MAX_REQUESTS: u32 = 100;
const DEFAULT_SUSPICIOUS_ACTIVITY_THRESHOLD: u32 = 10;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_ANALYSIS_INTERVAL_SECS: u64 = 60;
const DEFAULT_AUDIT_MAX_ENTRIES: usize = 10_000;
const DEFAULT_AUDIT_RETAIN_ENTRIES: usize = 5_000;
const DEFAULT_EVENT_MAX_ENTRIES: usize = 1_000;
const DEFAULT_EVENT_RETAIN_ENTRIES: usize = 500;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionAlgorithm {
    #[default]
    ChaCha20Poly1305,
}

impl fmt::Display for EncryptionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChaCha20Poly1305 => write!(f, "chacha20-poly1305"),
        }
    }
}

impl FromStr for EncryptionAlgorithm {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "chacha20-poly1305" | "chacha20poly1305" => Ok(Self::ChaCha20Poly1305),
            other => Err(ConfigError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    pub algorithm: EncryptionAlgorithm,
    pub key_rotation_interval_days: u32,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            algorithm: EncryptionAlgorithm::default(),
            key_rotation_interval_days: DEFAULT_KEY_ROTATION_INTERVAL_DAYS,
        }
    }
}

impl EncryptionConfig {
    #[must_use]
    pub fn key_rotation_interval(&self) -> Duration {
        Duration::days(i64::from(self.key_rotation_interval_days))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthenticationConfig {
    /// Idle timeout measured from the last validated request.
    pub session_timeout_minutes: u32,
    /// Absolute lifetime measured from session creation.
    pub session_lifetime_hours: u32,
    pub max_login_attempts: u32,
    pub lockout_duration_minutes: u32,
    pub require_mfa: bool,
}

impl Default for AuthenticationConfig {
    fn default() -> Self {
        Self {
            session_timeout_minutes: DEFAULT_SESSION_TIMEOUT_MINUTES,
            session_lifetime_hours: DEFAULT_SESSION_LIFETIME_HOURS,
            max_login_attempts: DEFAULT_MAX_LOGIN_ATTEMPTS,
            lockout_duration_minutes: DEFAULT_LOCKOUT_DURATION_MINUTES,
            require_mfa: false,
        }
    }
}

impl AuthenticationConfig {
    #[must_use]
    pub fn session_timeout(&self) -> Duration {
        Duration::minutes(i64::from(self.session_timeout_minutes))
    }

    #[must_use]
    pub fn session_lifetime(&self) -> Duration {
        Duration::hours(i64::from(self.session_lifetime_hours))
    }

    #[must_use]
    pub fn lockout_duration(&self) -> Duration {
        Duration::minutes(i64::from(self.lockout_duration_minutes))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_ms: u64,
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_RATE_LIMIT_WINDOW_MS,
            max_requests: DEFAULT_RATE_LIMIT_MAX_REQUESTS,
        }
    }
}

impl RateLimitConfig {
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::milliseconds(i64::try_from(self.window_ms).unwrap_or(i64::MAX))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub suspicious_activity_threshold: u32,
    pub session_sweep_interval_secs: u64,
    pub threat_analysis_interval_secs: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            suspicious_activity_threshold: DEFAULT_SUSPICIOUS_ACTIVITY_THRESHOLD,
            session_sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            threat_analysis_interval_secs: DEFAULT_ANALYSIS_INTERVAL_SECS,
        }
    }
}

/// Retention bounds for the append-only sinks. Once a sink grows past `max_*`
/// it is trimmed to the newest `retain_*` entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    pub max_entries: usize,
    pub retain_entries: usize,
    pub max_events: usize,
    pub retain_events: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: DEFAULT_AUDIT_MAX_ENTRIES,
            retain_entries: DEFAULT_AUDIT_RETAIN_ENTRIES,
            max_events: DEFAULT_EVENT_MAX_ENTRIES,
            retain_events: DEFAULT_EVENT_RETAIN_ENTRIES,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub encryption: EncryptionConfig,
    pub authentication: AuthenticationConfig,
    pub rate_limit: RateLimitConfig,
    pub monitoring: MonitoringConfig,
    pub audit: AuditConfig,
}

impl SecurityConfig {
    #[must_use]
    pub fn with_key_rotation_interval_days(mut self, days: u32) -> Self {
        self.encryption.key_rotation_interval_days = days;
        self
    }

    #[must_use]
    pub fn with_session_timeout_minutes(mut self, minutes: u32) -> Self {
        self.authentication.session_timeout_minutes = minutes;
        self
    }

    #[must_use]
    pub fn with_session_lifetime_hours(mut self, hours: u32) -> Self {
        self.authentication.session_lifetime_hours = hours;
        self
    }

    #[must_use]
    pub fn with_max_login_attempts(mut self, attempts: u32) -> Self {
        self.authentication.max_login_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_lockout_duration_minutes(mut self, minutes: u32) -> Self {
        self.authentication.lockout_duration_minutes = minutes;
        self
    }

    #[must_use]
    pub fn with_require_mfa(mut self, require: bool) -> Self {
        self.authentication.require_mfa = require;
        self
    }

    #[must_use]
    pub fn with_rate_limit(mut self, window_ms: u64, max_requests: u32) -> Self {
        self.rate_limit = RateLimitConfig {
            window_ms,
            max_requests,
        };
        self
    }

    #[must_use]
    pub fn with_suspicious_activity_threshold(mut self, threshold: u32) -> Self {
        self.monitoring.suspicious_activity_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_audit_enabled(mut self, enabled: bool) -> Self {
        self.audit.enabled = enabled;
        self
    }

    /// Rejects configurations that would disable a control by accident.
    ///
    /// # Errors
    /// Returns `ConfigError` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero: [(&'static str, u64); 9] = [
            (
                "encryption.key_rotation_interval_days",
                u64::from(self.encryption.key_rotation_interval_days),
            ),
            (
                "authentication.session_timeout_minutes",
                u64::from(self.authentication.session_timeout_minutes),
            ),
            (
                "authentication.session_lifetime_hours",
                u64::from(self.authentication.session_lifetime_hours),
            ),
            (
                "authentication.max_login_attempts",
                u64::from(self.authentication.max_login_attempts),
            ),
            (
                "authentication.lockout_duration_minutes",
                u64::from(self.authentication.lockout_duration_minutes),
            ),
            ("rate_limit.window_ms", self.rate_limit.window_ms),
            (
                "rate_limit.max_requests",
                u64::from(self.rate_limit.max_requests),
            ),
            (
                "monitoring.session_sweep_interval_secs",
                self.monitoring.session_sweep_interval_secs,
            ),
            (
                "monitoring.threat_analysis_interval_secs",
                self.monitoring.threat_analysis_interval_secs,
            ),
        ];
        if let Some((field, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero { field });
        }

        let retention = [
            (
                "audit.retain_entries",
                self.audit.retain_entries,
                self.audit.max_entries,
            ),
            (
                "audit.retain_events",
                self.audit.retain_events,
                self.audit.max_events,
            ),
        ];
        for (field, keep, max) in retention {
            if max == 0 {
                return Err(ConfigError::Zero { field });
            }
            if keep >= max {
                return Err(ConfigError::Retention { field, keep, max });
            }
        }

        Ok(())
    }
}
