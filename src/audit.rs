//! Append-only, retention-bounded audit trail.
//!
//! Writes never fail the guarded operation: a disabled logger drops entries and
//! a poisoned lock is recovered. Once the trail grows past `max_entries` it is
//! trimmed to the newest `retain_entries`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, PoisonError,
    },
};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditResult {
    Success,
    Failure,
    Blocked,
}

impl fmt::Display for AuditResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Blocked => "blocked",
        };
        f.write_str(value)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SecurityAuditLog {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<String>,
    pub action: String,
    pub resource: String,
    pub result: AuditResult,
    pub details: Value,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Caller-supplied part of an audit entry; id and timestamp are assigned on append.
#[derive(Clone, Debug)]
pub struct AuditRecord {
    pub user_id: Option<String>,
    pub action: String,
    pub resource: String,
    pub result: AuditResult,
    pub details: Value,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl AuditRecord {
    #[must_use]
    pub fn new(action: &str, resource: &str, result: AuditResult) -> Self {
        Self {
            user_id: None,
            action: action.to_string(),
            resource: resource.to_string(),
            result,
            details: Value::Null,
            ip: None,
            user_agent: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    #[must_use]
    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    #[must_use]
    pub fn with_context(mut self, ip: Option<String>, user_agent: Option<String>) -> Self {
        self.ip = ip;
        self.user_agent = user_agent;
        self
    }
}

#[derive(Debug)]
pub struct AuditLogger {
    enabled: bool,
    max_entries: usize,
    retain_entries: usize,
    entries: Mutex<VecDeque<SecurityAuditLog>>,
    trimmed: AtomicU64,
}

impl AuditLogger {
    #[must_use]
    pub fn new(enabled: bool, max_entries: usize, retain_entries: usize) -> Self {
        Self {
            enabled,
            max_entries,
            retain_entries: retain_entries.min(max_entries),
            entries: Mutex::new(VecDeque::new()),
            trimmed: AtomicU64::new(0),
        }
    }

    /// Appends an entry. Returns its id, or `None` when auditing is disabled.
    pub fn record(&self, record: AuditRecord, now: DateTime<Utc>) -> Option<Uuid> {
        if !self.enabled {
            return None;
        }

        let entry = SecurityAuditLog {
            id: Uuid::new_v4(),
            timestamp: now,
            user_id: record.user_id,
            action: record.action,
            resource: record.resource,
            result: record.result,
            details: record.details,
            ip: record.ip,
            user_agent: record.user_agent,
        };
        let id = entry.id;
        debug!(
            action = %entry.action,
            resource = %entry.resource,
            result = %entry.result,
            "Audit entry recorded"
        );

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.push_back(entry);
        if entries.len() > self.max_entries {
            let excess = entries.len() - self.retain_entries;
            entries.drain(..excess);
            drop(entries);
            self.trimmed.fetch_add(excess as u64, Ordering::Relaxed);
            info!(dropped = excess, "Audit trail trimmed");
        }
        Some(id)
    }

    /// The newest `limit` entries, oldest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<SecurityAuditLog> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total entries discarded by retention trimming since start.
    #[must_use]
    pub fn trimmed_total(&self) -> u64 {
        self.trimmed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_entries_in_order() {
        let logger = AuditLogger::new(true, 10, 5);
        let now = Utc::now();
        logger.record(AuditRecord::new("login", "session", AuditResult::Success), now);
        logger.record(
            AuditRecord::new("decrypt", "field", AuditResult::Failure)
                .with_details(json!({"key_id": "k1"}))
                .with_user(Some("user-1".to_string())),
            now,
        );

        let recent = logger.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].action, "login");
        assert_eq!(recent[1].result, AuditResult::Failure);
        assert_eq!(recent[1].user_id.as_deref(), Some("user-1"));
    }

    #[test]
    fn disabled_logger_drops_entries() {
        let logger = AuditLogger::new(false, 10, 5);
        let id = logger.record(
            AuditRecord::new("login", "session", AuditResult::Success),
            Utc::now(),
        );
        assert!(id.is_none());
        assert!(logger.is_empty());
    }

    #[test]
    fn trims_to_newest_after_trigger() {
        let logger = AuditLogger::new(true, 10_000, 5_000);
        let now = Utc::now();
        for i in 0..10_000 {
            logger.record(
                AuditRecord::new("op", &format!("resource-{i}"), AuditResult::Success),
                now,
            );
        }
        assert_eq!(logger.len(), 10_000);

        logger.record(
            AuditRecord::new("op", "resource-10000", AuditResult::Success),
            now,
        );
        assert_eq!(logger.len(), 5_000);
        assert_eq!(logger.trimmed_total(), 5_001);

        let entries = logger.recent(5_000);
        assert_eq!(entries[0].resource, "resource-5001");
        assert_eq!(entries[4_999].resource, "resource-10000");
    }

    #[test]
    fn recent_limits_to_newest() {
        let logger = AuditLogger::new(true, 100, 50);
        let now = Utc::now();
        for i in 0..5 {
            logger.record(
                AuditRecord::new("op", &i.to_string(), AuditResult::Blocked),
                now,
            );
        }
        let recent: Vec<String> = logger.recent(2).into_iter().map(|e| e.resource).collect();
        assert_eq!(recent, vec!["3".to_string(), "4".to_string()]);
    }
}
