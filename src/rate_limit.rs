//! Rate limiting primitives for request admission.

use chrono::{DateTime, Duration, Utc};
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

pub trait RateLimiter: Send + Sync {
    /// Counts one request for `key` and decides whether it is admitted.
    fn check(&self, key: &str, now: DateTime<Utc>) -> RateLimitDecision;
    /// Drops windows that ended before `now`. Returns how many were removed.
    fn sweep(&self, now: DateTime<Utc>) -> usize;
}

#[derive(Clone, Debug)]
pub struct NoopRateLimiter;

impl RateLimiter for NoopRateLimiter {
    fn check(&self, _key: &str, _now: DateTime<Utc>) -> RateLimitDecision {
        RateLimitDecision::Allowed
    }

    fn sweep(&self, _now: DateTime<Utc>) -> usize {
        0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitRecord {
    pub count: u32,
    pub window_reset_at: DateTime<Utc>,
}

/// Fixed-window counter: a window starts with the first request for a key and
/// resets wholesale once `window_reset_at` passes.
#[derive(Debug)]
pub struct FixedWindowRateLimiter {
    window: Duration,
    max_requests: u32,
    records: Mutex<HashMap<String, RateLimitRecord>>,
}

impl FixedWindowRateLimiter {
    #[must_use]
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            records: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn record(&self, key: &str) -> Option<RateLimitRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }
}

impl RateLimiter for FixedWindowRateLimiter {
    fn check(&self, key: &str, now: DateTime<Utc>) -> RateLimitDecision {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        match records.get_mut(key) {
            Some(record) if now < record.window_reset_at => {
                if record.count >= self.max_requests {
                    debug!(key, count = record.count, "Rate limit exceeded");
                    return RateLimitDecision::Limited;
                }
                record.count += 1;
                RateLimitDecision::Allowed
            }
            _ => {
                records.insert(
                    key.to_string(),
                    RateLimitRecord {
                        count: 1,
                        window_reset_at: now
                            .checked_add_signed(self.window)
                            .unwrap_or(DateTime::<Utc>::MAX_UTC),
                    },
                );
                RateLimitDecision::Allowed
            }
        }
    }

    fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|_, record| now < record.window_reset_at);
        before - records.len()
    }
}
