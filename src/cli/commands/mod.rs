pub mod logging;
pub mod security;

use clap::{
    builder::styling::{AnsiColor, Effects, Styles},
    Arg, ColorChoice, Command,
};

pub const ARG_REPORT_INTERVAL: &str = "report-interval";

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("warden")
        .about("Security and session manager")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new(ARG_REPORT_INTERVAL)
                .long(ARG_REPORT_INTERVAL)
                .help("Seconds between security dashboard reports")
                .default_value("60")
                .env("WARDEN_REPORT_INTERVAL")
                .value_parser(clap::value_parser!(u64).range(1..)),
        );

    let command = security::with_args(command);
    logging::with_args(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;

    #[test]
    fn test_new() {
        let command = new();

        assert_eq!(command.get_name(), "warden");
        assert_eq!(
            command.get_about().map(ToString::to_string),
            Some("Security and session manager".to_string())
        );
        assert_eq!(
            command.get_version().map(ToString::to_string),
            Some(env!("CARGO_PKG_VERSION").to_string())
        );
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_defaults() {
        temp_env::with_vars(
            [
                ("WARDEN_REPORT_INTERVAL", None::<&str>),
                ("WARDEN_MAX_LOGIN_ATTEMPTS", None),
                ("WARDEN_REQUIRE_MFA", None),
                ("WARDEN_LOG_FORMAT", None),
            ],
            || {
                let matches = new().get_matches_from(vec!["warden"]);
                assert_eq!(matches.get_one::<u64>(ARG_REPORT_INTERVAL).copied(), Some(60));
                assert_eq!(
                    matches
                        .get_one::<String>(logging::ARG_LOG_FORMAT)
                        .map(String::as_str),
                    Some("pretty")
                );
                assert_eq!(security::parse(&matches).unwrap(), SecurityConfig::default());
            },
        );
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_check_args() {
        temp_env::with_vars([("WARDEN_DISABLE_AUDIT", None::<&str>)], || {
            let matches = new().get_matches_from(vec![
                "warden",
                "--max-login-attempts",
                "3",
                "--lockout-minutes",
                "10",
                "--require-mfa",
                "--rate-limit-window-ms",
                "1000",
                "--rate-limit-max-requests",
                "5",
                "--encryption-algorithm",
                "chacha20-poly1305",
            ]);
            let config = security::parse(&matches).unwrap();

            assert_eq!(config.authentication.max_login_attempts, 3);
            assert_eq!(config.authentication.lockout_duration_minutes, 10);
            assert!(config.authentication.require_mfa);
            assert_eq!(config.rate_limit.window_ms, 1000);
            assert_eq!(config.rate_limit.max_requests, 5);
            assert!(config.audit.enabled);
        });
    }

    #[test]
    fn test_rejects_unsupported_algorithm() {
        let result =
            new().try_get_matches_from(vec!["warden", "--encryption-algorithm", "aes-256-gcm"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_zero_window() {
        let result = new().try_get_matches_from(vec!["warden", "--rate-limit-window-ms", "0"]);
        assert!(result.is_err());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_check_env() {
        temp_env::with_vars(
            [
                ("WARDEN_REPORT_INTERVAL", Some("15")),
                ("WARDEN_SESSION_TIMEOUT_MINUTES", Some("45")),
                ("WARDEN_SUSPICIOUS_ACTIVITY_THRESHOLD", Some("4")),
                ("WARDEN_DISABLE_AUDIT", Some("true")),
                ("WARDEN_LOG_FORMAT", Some("json")),
                ("WARDEN_LOG_LEVEL", Some("info")),
            ],
            || {
                let matches = new().get_matches_from(vec!["warden"]);
                assert_eq!(matches.get_one::<u64>(ARG_REPORT_INTERVAL).copied(), Some(15));
                assert_eq!(
                    matches
                        .get_one::<String>(logging::ARG_LOG_FORMAT)
                        .map(String::as_str),
                    Some("json")
                );
                assert_eq!(
                    matches.get_one::<u8>(logging::ARG_VERBOSITY).copied(),
                    Some(2)
                );

                let config = security::parse(&matches).unwrap();
                assert_eq!(config.authentication.session_timeout_minutes, 45);
                assert_eq!(config.monitoring.suspicious_activity_threshold, 4);
                assert!(!config.audit.enabled);
            },
        );
    }

    #[test]
    fn test_check_log_level_env() {
        let levels = ["error", "warn", "info", "debug", "trace"];
        for (index, &level) in levels.iter().enumerate() {
            temp_env::with_vars([("WARDEN_LOG_LEVEL", Some(level))], || {
                let matches = new().get_matches_from(vec!["warden"]);
                assert_eq!(
                    matches.get_one::<u8>(logging::ARG_VERBOSITY).copied(),
                    u8::try_from(index).ok()
                );
            });
        }
    }

    #[test]
    fn test_check_log_level_verbosity() {
        for count in 0..5usize {
            temp_env::with_vars([("WARDEN_LOG_LEVEL", None::<String>)], || {
                let mut args = vec!["warden".to_string()];
                if count > 0 {
                    args.push(format!("-{}", "v".repeat(count)));
                }
                let matches = new().get_matches_from(args);
                assert_eq!(
                    matches
                        .get_one::<u8>(logging::ARG_VERBOSITY)
                        .copied()
                        .unwrap_or(0),
                    u8::try_from(count).unwrap_or(u8::MAX)
                );
            });
        }
    }
}
