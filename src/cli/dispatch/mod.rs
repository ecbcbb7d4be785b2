//! Maps validated CLI arguments to an action.

use crate::cli::actions::{monitor::Args, Action};
use crate::cli::commands::{security, ARG_REPORT_INTERVAL};
use anyhow::{Context, Result};
use std::time::Duration;

/// Map validated CLI matches to the monitor action.
///
/// # Errors
/// Returns an error if the security configuration is invalid.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let report_interval = matches
        .get_one::<u64>(ARG_REPORT_INTERVAL)
        .copied()
        .context("missing required argument: --report-interval")?;

    let config = security::parse(matches)?;

    Ok(Action::Monitor(Args {
        config,
        report_interval: Duration::from_secs(report_interval),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_monitor_action() {
        temp_env::with_vars(
            [
                ("WARDEN_REPORT_INTERVAL", Some("5")),
                ("WARDEN_MAX_LOGIN_ATTEMPTS", Some("3")),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["warden"]);
                let result = handler(&matches);
                assert!(result.is_ok());
                if let Ok(Action::Monitor(args)) = result {
                    assert_eq!(args.report_interval, Duration::from_secs(5));
                    assert_eq!(args.config.authentication.max_login_attempts, 3);
                }
            },
        );
    }
}
