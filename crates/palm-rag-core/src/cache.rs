//! TTL cache for AI responses, keyed by a content fingerprint.
//!
//! A read past an entry's `expires_at` counts as a miss and drops the
//! entry. Writing to an existing key overwrites it. Expired entries that
//! are never read again stay in memory until [`ResponseCache::cleanup`]
//! is called; nothing sweeps in the background.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::clock::{Clock, SystemClock};

/// Deterministic SHA-256 hex fingerprint of any serializable value.
///
/// Struct fields serialize in declaration order, so the same request
/// parameters always produce the same key.
pub fn fingerprint<T: Serialize + ?Sized>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries currently held, including expired ones not yet swept.
    pub size: usize,
    /// `hits / (hits + misses)`, `0.0` before the first lookup.
    pub hit_rate: f64,
}

/// Response cache interface, injected wherever caching happens.
pub trait ResponseCache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    /// Store with the cache's default TTL.
    fn set(&self, key: &str, value: String);

    fn set_with_ttl(&self, key: &str, value: String, ttl_secs: u64);

    fn delete(&self, key: &str) -> bool;

    /// Remove every entry and reset statistics.
    fn clear(&self);

    /// Remove expired entries, returning how many were removed.
    fn cleanup(&self) -> usize;

    fn stats(&self) -> CacheStats;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    /// Unix milliseconds.
    expires_at: i64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
}

/// Process-local [`ResponseCache`].
pub struct InMemoryCache {
    state: Mutex<CacheState>,
    default_ttl_secs: u64,
    clock: Arc<dyn Clock>,
}

impl InMemoryCache {
    pub fn new(default_ttl_secs: u64) -> Self {
        Self::with_clock(default_ttl_secs, Arc::new(SystemClock))
    }

    pub fn with_clock(default_ttl_secs: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            default_ttl_secs,
            clock,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ResponseCache for InMemoryCache {
    fn get(&self, key: &str) -> Option<String> {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        let live = match state.entries.get(key) {
            Some(entry) if now < entry.expires_at => Some(entry.value.clone()),
            Some(_) => {
                state.entries.remove(key);
                None
            }
            None => None,
        };
        match live {
            Some(value) => {
                state.hits += 1;
                Some(value)
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    fn set(&self, key: &str, value: String) {
        self.set_with_ttl(key, value, self.default_ttl_secs);
    }

    fn set_with_ttl(&self, key: &str, value: String, ttl_secs: u64) {
        let expires_at = self
            .clock
            .now_ms()
            .saturating_add((ttl_secs as i64).saturating_mul(1000));
        self.lock()
            .entries
            .insert(key.to_string(), CacheEntry { value, expires_at });
    }

    fn delete(&self, key: &str) -> bool {
        self.lock().entries.remove(key).is_some()
    }

    fn clear(&self) {
        *self.lock() = CacheState::default();
    }

    fn cleanup(&self) -> usize {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|_, e| now < e.expires_at);
        before - state.entries.len()
    }

    fn stats(&self) -> CacheStats {
        let state = self.lock();
        let lookups = state.hits + state.misses;
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            size: state.entries.len(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
        }
    }
}
