//! Per-identifier lockout after consecutive failed authentications.
//!
//! Independent of request rate limiting: only failed credential or MFA checks
//! count, and any successful authentication clears the record.

use chrono::{DateTime, Duration, Utc};
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};
use tracing::{debug, warn};

use crate::error::SecurityError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FailedLoginRecord {
    pub count: u32,
    pub last_attempt_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct LockoutGuard {
    max_attempts: u32,
    lockout_duration: Duration,
    records: Mutex<HashMap<String, FailedLoginRecord>>,
}

impl LockoutGuard {
    #[must_use]
    pub fn new(max_attempts: u32, lockout_duration: Duration) -> Self {
        Self {
            max_attempts,
            lockout_duration,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the remaining lockout time in seconds, `0` when not locked.
    pub fn cooldown_seconds(&self, key: &str, now: DateTime<Utc>) -> u64 {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(record) = records.get(key) else {
            return 0;
        };
        if record.count < self.max_attempts {
            return 0;
        }
        let elapsed = now.signed_duration_since(record.last_attempt_at);
        if elapsed < self.lockout_duration {
            u64::try_from((self.lockout_duration - elapsed).num_seconds()).unwrap_or(0).max(1)
        } else {
            0
        }
    }

    /// # Errors
    /// Returns `AccountLocked` while the identifier is inside its lockout window.
    pub fn check(&self, key: &str, now: DateTime<Utc>) -> Result<(), SecurityError> {
        match self.cooldown_seconds(key, now) {
            0 => Ok(()),
            remaining_seconds => Err(SecurityError::AccountLocked { remaining_seconds }),
        }
    }

    /// Registers a failed attempt and returns the consecutive failure count.
    ///
    /// A record whose lockout window has fully elapsed starts over, so an
    /// expired lockout does not re-trigger on the very next failure.
    pub fn record_failure(&self, key: &str, now: DateTime<Utc>) -> u32 {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let record = records
            .entry(key.to_string())
            .or_insert(FailedLoginRecord {
                count: 0,
                last_attempt_at: now,
            });
        if now.signed_duration_since(record.last_attempt_at) >= self.lockout_duration {
            record.count = 0;
        }
        record.count = record.count.saturating_add(1);
        record.last_attempt_at = now;

        if record.count >= self.max_attempts {
            warn!(key, count = record.count, "Lockout threshold reached");
        } else {
            debug!(key, count = record.count, "Failed attempt recorded");
        }
        record.count
    }

    pub fn record_success(&self, key: &str) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    #[must_use]
    pub fn failures(&self, key: &str) -> u32 {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(0, |record| record.count)
    }

    /// Forgets records whose lockout window has elapsed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|_, record| {
            now.signed_duration_since(record.last_attempt_at) < self.lockout_duration
        });
        before - records.len()
    }
}
