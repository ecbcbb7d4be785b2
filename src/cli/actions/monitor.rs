use crate::{
    auth::DenyAllVerifier,
    config::SecurityConfig,
    manager::{SecurityDashboard, SecurityManager},
};
use anyhow::{Context, Result};
use std::{sync::Arc, time::Duration};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

#[derive(Debug)]
pub struct Args {
    pub config: SecurityConfig,
    pub report_interval: Duration,
}

/// Run the security manager's background tasks and report the dashboard
/// until Ctrl-C.
///
/// Logins are rejected: no credential or MFA backend is attached in this mode.
///
/// # Errors
/// Returns an error if the manager cannot be constructed or the signal handler fails.
pub async fn execute(args: Args) -> Result<()> {
    let manager = Arc::new(
        SecurityManager::new(
            args.config,
            Arc::new(DenyAllVerifier),
            Arc::new(DenyAllVerifier),
        )
        .context("failed to initialize security manager")?,
    );
    let tasks = manager.start_background_tasks();

    let mut ticker = interval(args.report_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            _ = ticker.tick() => report(&manager.get_security_dashboard()),
            signal = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break signal.context("failed to listen for Ctrl-C");
            }
        }
    };

    tasks.shutdown().await;
    result
}

fn report(dashboard: &SecurityDashboard) {
    let unresolved = dashboard
        .recent_events
        .iter()
        .filter(|event| !event.resolved)
        .count();
    let active_key_id = dashboard
        .active_key_id
        .map_or_else(|| "none".to_string(), |id| id.to_string());

    if dashboard.active_key_id.is_none() {
        warn!("No active encryption key");
    }
    info!(
        active_sessions = dashboard.active_sessions,
        threat_level = %dashboard.threat_level,
        blocked_ips = dashboard.blocked_ip_count,
        recent_events = dashboard.recent_events.len(),
        unresolved_events = unresolved,
        audit_entries = dashboard.audit_logs.len(),
        keys = dashboard.key_count,
        active_key_id = %active_key_id,
        "Security dashboard"
    );
}
