use anyhow::{Context, Result};
use clap::{builder::ValueParser, Arg, ArgAction, ArgMatches, Command};

use crate::config::{EncryptionAlgorithm, SecurityConfig};

pub const ARG_ALGORITHM: &str = "encryption-algorithm";
pub const ARG_KEY_ROTATION_DAYS: &str = "key-rotation-days";
pub const ARG_SESSION_TIMEOUT_MINUTES: &str = "session-timeout-minutes";
pub const ARG_SESSION_LIFETIME_HOURS: &str = "session-lifetime-hours";
pub const ARG_MAX_LOGIN_ATTEMPTS: &str = "max-login-attempts";
pub const ARG_LOCKOUT_MINUTES: &str = "lockout-minutes";
pub const ARG_REQUIRE_MFA: &str = "require-mfa";
pub const ARG_RATE_LIMIT_WINDOW_MS: &str = "rate-limit-window-ms";
pub const ARG_RATE_LIMIT_MAX_REQUESTS: &str = "rate-limit-max-requests";
pub const ARG_SUSPICIOUS_THRESHOLD: &str = "suspicious-activity-threshold";
pub const ARG_SWEEP_INTERVAL: &str = "session-sweep-interval";
pub const ARG_ANALYSIS_INTERVAL: &str = "threat-analysis-interval";
pub const ARG_DISABLE_AUDIT: &str = "disable-audit";

fn validator_algorithm() -> ValueParser {
    ValueParser::from(move |value: &str| -> std::result::Result<EncryptionAlgorithm, String> {
        value.parse::<EncryptionAlgorithm>().map_err(|e| e.to_string())
    })
}

/// Build a validated `SecurityConfig`; unset options keep their defaults.
///
/// # Errors
/// Returns an error if the resulting configuration is invalid.
pub fn parse(matches: &ArgMatches) -> Result<SecurityConfig> {
    let mut config = SecurityConfig::default();

    if let Some(algorithm) = matches.get_one::<EncryptionAlgorithm>(ARG_ALGORITHM) {
        config.encryption.algorithm = *algorithm;
    }
    if let Some(days) = matches.get_one::<u32>(ARG_KEY_ROTATION_DAYS) {
        config.encryption.key_rotation_interval_days = *days;
    }

    let auth = &mut config.authentication;
    if let Some(minutes) = matches.get_one::<u32>(ARG_SESSION_TIMEOUT_MINUTES) {
        auth.session_timeout_minutes = *minutes;
    }
    if let Some(hours) = matches.get_one::<u32>(ARG_SESSION_LIFETIME_HOURS) {
        auth.session_lifetime_hours = *hours;
    }
    if let Some(attempts) = matches.get_one::<u32>(ARG_MAX_LOGIN_ATTEMPTS) {
        auth.max_login_attempts = *attempts;
    }
    if let Some(minutes) = matches.get_one::<u32>(ARG_LOCKOUT_MINUTES) {
        auth.lockout_duration_minutes = *minutes;
    }
    auth.require_mfa = matches.get_flag(ARG_REQUIRE_MFA);

    if let Some(window_ms) = matches.get_one::<u64>(ARG_RATE_LIMIT_WINDOW_MS) {
        config.rate_limit.window_ms = *window_ms;
    }
    if let Some(max) = matches.get_one::<u32>(ARG_RATE_LIMIT_MAX_REQUESTS) {
        config.rate_limit.max_requests = *max;
    }

    let monitoring = &mut config.monitoring;
    if let Some(threshold) = matches.get_one::<u32>(ARG_SUSPICIOUS_THRESHOLD) {
        monitoring.suspicious_activity_threshold = *threshold;
    }
    if let Some(secs) = matches.get_one::<u64>(ARG_SWEEP_INTERVAL) {
        monitoring.session_sweep_interval_secs = *secs;
    }
    if let Some(secs) = matches.get_one::<u64>(ARG_ANALYSIS_INTERVAL) {
        monitoring.threat_analysis_interval_secs = *secs;
    }

    config.audit.enabled = !matches.get_flag(ARG_DISABLE_AUDIT);

    config.validate().context("invalid security configuration")?;
    Ok(config)
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ALGORITHM)
                .long(ARG_ALGORITHM)
                .help("Field encryption algorithm (chacha20-poly1305)")
                .env("WARDEN_ENCRYPTION_ALGORITHM")
                .value_parser(validator_algorithm()),
        )
        .arg(
            Arg::new(ARG_KEY_ROTATION_DAYS)
                .long(ARG_KEY_ROTATION_DAYS)
                .help("Days between scheduled key rotations (default: 30)")
                .env("WARDEN_KEY_ROTATION_DAYS")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new(ARG_SESSION_TIMEOUT_MINUTES)
                .long(ARG_SESSION_TIMEOUT_MINUTES)
                .help("Idle minutes before a session requires re-authentication (default: 30)")
                .env("WARDEN_SESSION_TIMEOUT_MINUTES")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new(ARG_SESSION_LIFETIME_HOURS)
                .long(ARG_SESSION_LIFETIME_HOURS)
                .help("Absolute session lifetime in hours (default: 24)")
                .env("WARDEN_SESSION_LIFETIME_HOURS")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new(ARG_MAX_LOGIN_ATTEMPTS)
                .long(ARG_MAX_LOGIN_ATTEMPTS)
                .help("Consecutive failed logins before lockout (default: 5)")
                .env("WARDEN_MAX_LOGIN_ATTEMPTS")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new(ARG_LOCKOUT_MINUTES)
                .long(ARG_LOCKOUT_MINUTES)
                .help("Lockout duration in minutes (default: 15)")
                .env("WARDEN_LOCKOUT_MINUTES")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new(ARG_REQUIRE_MFA)
                .long(ARG_REQUIRE_MFA)
                .help("Require a second factor on every login")
                .env("WARDEN_REQUIRE_MFA")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_RATE_LIMIT_WINDOW_MS)
                .long(ARG_RATE_LIMIT_WINDOW_MS)
                .help("Rate limit window in milliseconds (default: 60000)")
                .env("WARDEN_RATE_LIMIT_WINDOW_MS")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_RATE_LIMIT_MAX_REQUESTS)
                .long(ARG_RATE_LIMIT_MAX_REQUESTS)
                .help("Requests allowed per window and IP (default: 100)")
                .env("WARDEN_RATE_LIMIT_MAX_REQUESTS")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new(ARG_SUSPICIOUS_THRESHOLD)
                .long(ARG_SUSPICIOUS_THRESHOLD)
                .help("Failed logins per hour that flag a user as suspicious (default: 10)")
                .env("WARDEN_SUSPICIOUS_ACTIVITY_THRESHOLD")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_SWEEP_INTERVAL)
                .long(ARG_SWEEP_INTERVAL)
                .help("Seconds between expired-session sweeps (default: 60)")
                .env("WARDEN_SESSION_SWEEP_INTERVAL")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_ANALYSIS_INTERVAL)
                .long(ARG_ANALYSIS_INTERVAL)
                .help("Seconds between threat analysis passes (default: 60)")
                .env("WARDEN_THREAT_ANALYSIS_INTERVAL")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_DISABLE_AUDIT)
                .long(ARG_DISABLE_AUDIT)
                .help("Do not keep an audit trail")
                .env("WARDEN_DISABLE_AUDIT")
                .action(ArgAction::SetTrue),
        )
}
