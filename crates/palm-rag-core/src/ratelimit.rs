//! Fixed-window rate limiting per `(identifier, endpoint class)`.
//!
//! Each pair gets a window that opens on its first request and lasts
//! `window_secs`. Up to `max_requests` checks are admitted inside a window;
//! the rest are refused with the time left until it closes. Entries are
//! created lazily and removed only by [`RateLimiter::cleanup`] or
//! [`RateLimiter::reset`].
//!
//! The check-and-increment happens under a single lock, so concurrent
//! requests on a multi-threaded runtime cannot both take the last slot.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};

/// Class used when a check names a class with no configured rule.
pub const DEFAULT_CLASS: &str = "default";

/// Deserialized from config as `max_requests`/`window_secs`, reported
/// over JSON in camelCase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct RateLimitRule {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl RateLimitRule {
    pub const fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs,
        }
    }

    fn window_ms(&self) -> i64 {
        (self.window_secs as i64).saturating_mul(1000)
    }
}

/// Built-in rules. Heavier operations get stricter ceilings.
pub fn default_rules() -> BTreeMap<String, RateLimitRule> {
    [
        ("chat", RateLimitRule::new(20, 60)),
        ("ai", RateLimitRule::new(10, 60)),
        ("search", RateLimitRule::new(60, 60)),
        ("vision", RateLimitRule::new(5, 60)),
        ("pdf", RateLimitRule::new(3, 300)),
        (DEFAULT_CLASS, RateLimitRule::new(100, 60)),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests left in the current window after this one.
    pub remaining: u32,
    /// Seconds until the window closes; `0` when allowed.
    pub retry_after_secs: u64,
    /// Unix milliseconds at which the current window closes.
    pub reset_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitEntry {
    pub identifier: String,
    pub endpoint_class: String,
    /// Unix milliseconds.
    pub window_start: i64,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSnapshot {
    pub total_entries: usize,
    /// Entries whose window is still open.
    pub active_entries: usize,
    /// Open-window entry count per endpoint class.
    pub by_class: BTreeMap<String, usize>,
    pub rules: BTreeMap<String, RateLimitRule>,
}

pub trait RateLimiter: Send + Sync {
    /// Count one request and decide whether to admit it.
    fn check(&self, identifier: &str, endpoint_class: &str) -> RateLimitDecision;

    /// Clear the window for one class, or every class when `None`.
    /// Returns how many entries were removed.
    fn reset(&self, identifier: &str, endpoint_class: Option<&str>) -> usize;

    /// Remove entries whose window has closed.
    fn cleanup(&self) -> usize;

    fn snapshot(&self) -> RateLimitSnapshot;
}

type EntryKey = (String, String);

pub struct FixedWindowLimiter {
    rules: BTreeMap<String, RateLimitRule>,
    entries: Mutex<HashMap<EntryKey, RateLimitEntry>>,
    clock: Arc<dyn Clock>,
}

impl FixedWindowLimiter {
    pub fn new(rules: BTreeMap<String, RateLimitRule>) -> Self {
        Self::with_clock(rules, Arc::new(SystemClock))
    }

    /// `rules` without a `"default"` entry get the built-in default rule.
    pub fn with_clock(mut rules: BTreeMap<String, RateLimitRule>, clock: Arc<dyn Clock>) -> Self {
        if !rules.contains_key(DEFAULT_CLASS) {
            if let Some(rule) = default_rules().remove(DEFAULT_CLASS) {
                rules.insert(DEFAULT_CLASS.to_string(), rule);
            }
        }
        Self {
            rules,
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn rule_for(&self, endpoint_class: &str) -> RateLimitRule {
        self.rules
            .get(endpoint_class)
            .or_else(|| self.rules.get(DEFAULT_CLASS))
            .copied()
            .unwrap_or(RateLimitRule::new(100, 60))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EntryKey, RateLimitEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_open(&self, entry: &RateLimitEntry, now: i64) -> bool {
        let rule = self.rule_for(&entry.endpoint_class);
        now < entry.window_start.saturating_add(rule.window_ms())
    }
}

impl RateLimiter for FixedWindowLimiter {
    fn check(&self, identifier: &str, endpoint_class: &str) -> RateLimitDecision {
        let rule = self.rule_for(endpoint_class);
        let now = self.clock.now_ms();
        let mut entries = self.lock();

        let entry = entries
            .entry((identifier.to_string(), endpoint_class.to_string()))
            .or_insert_with(|| RateLimitEntry {
                identifier: identifier.to_string(),
                endpoint_class: endpoint_class.to_string(),
                window_start: now,
                count: 0,
            });

        if now >= entry.window_start.saturating_add(rule.window_ms()) {
            entry.window_start = now;
            entry.count = 0;
        }
        let reset_at = entry.window_start.saturating_add(rule.window_ms());

        if entry.count >= rule.max_requests {
            let wait_ms = (reset_at - now).max(0);
            let retry_after_secs = ((wait_ms + 999) / 1000).max(1) as u64;
            tracing::debug!(
                identifier,
                endpoint_class,
                retry_after_secs,
                "rate limit exceeded"
            );
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                retry_after_secs,
                reset_at,
            };
        }

        entry.count += 1;
        RateLimitDecision {
            allowed: true,
            remaining: rule.max_requests - entry.count,
            retry_after_secs: 0,
            reset_at,
        }
    }

    fn reset(&self, identifier: &str, endpoint_class: Option<&str>) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|(id, class), _| {
            id != identifier || endpoint_class.is_some_and(|c| c != class)
        });
        before - entries.len()
    }

    fn cleanup(&self) -> usize {
        let now = self.clock.now_ms();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| self.is_open(e, now));
        before - entries.len()
    }

    fn snapshot(&self) -> RateLimitSnapshot {
        let now = self.clock.now_ms();
        let entries = self.lock();
        let mut by_class: BTreeMap<String, usize> = BTreeMap::new();
        let mut active_entries = 0;
        for entry in entries.values().filter(|e| self.is_open(e, now)) {
            active_entries += 1;
            *by_class.entry(entry.endpoint_class.clone()).or_default() += 1;
        }
        RateLimitSnapshot {
            total_entries: entries.len(),
            active_entries,
            by_class,
            rules: self.rules.clone(),
        }
    }
}
