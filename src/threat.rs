//! Security event bus and threat detection.
//!
//! Flow Overview:
//! 1) `log_event` appends to a bounded event list. Critical events run the
//!    remediation table before the call returns.
//! 2) `analyze` (periodic) looks at the last hour: IPs with five or more
//!    medium-or-higher events are blocked, then the threat level is recomputed.
//! 3) `detect_suspicious_activity` is an on-demand heuristic per user.
//!
//! Reads take a snapshot under the lock and evaluate after releasing it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    sync::{Arc, Mutex, PoisonError, RwLock},
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    events::{
        remediation, EventContext, SecurityAction, SecurityEvent, SecurityEventType, Severity,
    },
    session::SessionStore,
};

const ANALYSIS_WINDOW_MINUTES: i64 = 60;
const BLOCK_EVENT_THRESHOLD: usize = 5;
const BURST_WINDOW_SECONDS: i64 = 60;
const BURST_EVENT_LIMIT: usize = 50;
const HIGH_EVENT_LIMIT: usize = 3;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ThreatLevel {
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

impl ThreatLevel {
    /// Any critical → critical; more than three high → high; any high → medium.
    #[must_use]
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a SecurityEvent>) -> Self {
        let mut high = 0usize;
        for event in events {
            match event.severity {
                Severity::Critical => return Self::Critical,
                Severity::High => high += 1,
                Severity::Low | Severity::Medium => {}
            }
        }
        if high > HIGH_EVENT_LIMIT {
            Self::High
        } else if high > 0 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AnalysisReport {
    pub newly_blocked: Vec<String>,
    pub threat_level: ThreatLevel,
}

#[derive(Debug)]
pub struct ThreatDetector {
    sessions: Arc<SessionStore>,
    suspicious_activity_threshold: usize,
    max_events: usize,
    retain_events: usize,
    events: Mutex<VecDeque<SecurityEvent>>,
    blocked_ips: RwLock<HashSet<String>>,
    threat_level: RwLock<ThreatLevel>,
}

impl ThreatDetector {
    #[must_use]
    pub fn new(
        sessions: Arc<SessionStore>,
        suspicious_activity_threshold: u32,
        max_events: usize,
        retain_events: usize,
    ) -> Self {
        Self {
            sessions,
            suspicious_activity_threshold: usize::try_from(suspicious_activity_threshold)
                .unwrap_or(usize::MAX),
            max_events,
            retain_events: retain_events.min(max_events),
            events: Mutex::new(VecDeque::new()),
            blocked_ips: RwLock::new(HashSet::new()),
            threat_level: RwLock::new(ThreatLevel::Low),
        }
    }

    /// Records an event; critical events are remediated before this returns.
    pub fn log_event(
        &self,
        event_type: SecurityEventType,
        severity: Severity,
        context: EventContext,
        details: Value,
        now: DateTime<Utc>,
    ) -> SecurityEvent {
        let mut event = SecurityEvent {
            id: Uuid::new_v4(),
            event_type,
            severity,
            timestamp: now,
            user_id: context.user_id,
            username: context.username,
            session_id: context.session_id,
            ip: context.ip,
            user_agent: context.user_agent,
            details,
            resolved: false,
            actions: Vec::new(),
        };

        match severity {
            Severity::Critical => {
                error!(event_type = %event_type, ip = ?event.ip, "Critical security event");
                event.actions = self.remediate(&event);
                event.resolved = !event.actions.is_empty();
            }
            Severity::High => {
                warn!(event_type = %event_type, ip = ?event.ip, "Security event");
            }
            Severity::Low | Severity::Medium => {
                info!(
                    event_type = %event_type,
                    severity = %severity,
                    ip = ?event.ip,
                    "Security event"
                );
            }
        }

        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events.push_back(event.clone());
        if events.len() > self.max_events {
            let excess = events.len() - self.retain_events;
            events.drain(..excess);
        }
        event
    }

    fn remediate(&self, event: &SecurityEvent) -> Vec<SecurityAction> {
        let mut applied = Vec::new();
        for action in remediation(event.event_type, event.severity) {
            match action {
                SecurityAction::LogoutUser => {
                    if let Some(session_id) = event.session_id.as_deref() {
                        self.sessions.invalidate(session_id);
                        info!("Session force-invalidated");
                        applied.push(*action);
                    }
                }
                SecurityAction::BlockIp => {
                    if let Some(ip) = event.ip.as_deref() {
                        self.block_ip(ip);
                        applied.push(*action);
                    }
                }
            }
        }
        applied
    }

    /// Blocks abusive IPs seen in the last hour and recomputes the threat level.
    pub fn analyze(&self, now: DateTime<Utc>) -> AnalysisReport {
        let recent = self.events_since(now - Duration::minutes(ANALYSIS_WINDOW_MINUTES));

        let mut per_ip: HashMap<&str, usize> = HashMap::new();
        for event in &recent {
            if event.severity >= Severity::Medium {
                if let Some(ip) = event.ip.as_deref() {
                    *per_ip.entry(ip).or_default() += 1;
                }
            }
        }

        let mut newly_blocked: Vec<String> = per_ip
            .into_iter()
            .filter(|(ip, count)| *count >= BLOCK_EVENT_THRESHOLD && !self.is_blocked(ip))
            .map(|(ip, _)| ip.to_string())
            .collect();
        newly_blocked.sort();

        for ip in &newly_blocked {
            self.block_ip(ip);
            self.log_event(
                SecurityEventType::SuspiciousActivity,
                Severity::High,
                EventContext::ip(ip),
                json!({
                    "reason": "repeated security events",
                    "window_minutes": ANALYSIS_WINDOW_MINUTES,
                }),
                now,
            );
        }

        let since = now - Duration::minutes(ANALYSIS_WINDOW_MINUTES);
        let threat_level = ThreatLevel::from_events(&self.events_since(since));
        let previous = std::mem::replace(
            &mut *self.threat_level.write().unwrap_or_else(PoisonError::into_inner),
            threat_level,
        );
        if previous != threat_level {
            warn!(%previous, current = %threat_level, "Threat level changed");
        }

        AnalysisReport {
            newly_blocked,
            threat_level,
        }
    }

    /// Heuristic: too many recent failed logins, or a burst of events, for `user_id`.
    /// Events match on the resolved user id or on the login name, so failures with
    /// unknown passwords count too. A positive result is recorded as a
    /// `suspicious_activity` event.
    pub fn detect_suspicious_activity(
        &self,
        user_id: &str,
        activity: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let recent = self.events_since(now - Duration::minutes(ANALYSIS_WINDOW_MINUTES));
        let burst_start = now - Duration::seconds(BURST_WINDOW_SECONDS);

        let mine = recent.iter().filter(|event| {
            event.user_id.as_deref() == Some(user_id) || event.username.as_deref() == Some(user_id)
        });
        let (failed_logins, burst) = mine.fold((0usize, 0usize), |(failed, burst), event| {
            (
                failed + usize::from(event.event_type == SecurityEventType::LoginFailure),
                burst + usize::from(event.timestamp >= burst_start),
            )
        });

        let suspicious =
            failed_logins >= self.suspicious_activity_threshold || burst > BURST_EVENT_LIMIT;
        if suspicious {
            self.log_event(
                SecurityEventType::SuspiciousActivity,
                Severity::High,
                EventContext::default().with_user(user_id),
                json!({
                    "activity": activity,
                    "failed_logins": failed_logins,
                    "events_last_minute": burst,
                }),
                now,
            );
        }
        suspicious
    }

    pub fn block_ip(&self, ip: &str) {
        let inserted = self
            .blocked_ips
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ip.to_string());
        if inserted {
            warn!(ip, "IP blocked");
        }
    }

    pub fn unblock_ip(&self, ip: &str) -> bool {
        let removed = self
            .blocked_ips
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(ip);
        if removed {
            info!(ip, "IP unblocked");
        }
        removed
    }

    #[must_use]
    pub fn is_blocked(&self, ip: &str) -> bool {
        self.blocked_ips
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(ip)
    }

    #[must_use]
    pub fn blocked_count(&self) -> usize {
        self.blocked_ips
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn threat_level(&self) -> ThreatLevel {
        *self.threat_level.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks an event as handled. Returns `false` for unknown (or trimmed) ids.
    pub fn resolve_event(&self, event_id: Uuid) -> bool {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        match events.iter_mut().find(|event| event.id == event_id) {
            Some(event) => {
                event.resolved = true;
                true
            }
            None => false,
        }
    }

    /// The newest `limit` events, oldest first.
    #[must_use]
    pub fn recent_events(&self, limit: usize) -> Vec<SecurityEvent> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = events.len().saturating_sub(limit);
        events.iter().skip(skip).cloned().collect()
    }

    #[must_use]
    pub fn event_count(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn events_since(&self, since: DateTime<Utc>) -> Vec<SecurityEvent> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events
            .iter()
            .filter(|event| event.timestamp >= since)
            .cloned()
            .collect()
    }
}
