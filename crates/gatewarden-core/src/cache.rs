//! TTL cache for verification results.
//!
//! The cache amortizes repeated verifications of the same subject within a
//! short window; it is not a coordination primitive. Callers serialize
//! computation per key with the keyed mutex and use the cache only to skip
//! work that a previous holder already finished.
//!
//! Entries expire lazily: `get` drops an entry whose age has reached the
//! TTL, and [`ResultCache::purge_expired`] sweeps the whole table for
//! callers that want to bound memory between requests. A zero TTL disables
//! the cache entirely, which keeps the disable path out of every call site.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde_json::Value;

/// One cached result.
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    inserted_at: Instant,
}

/// A thread-safe keyed store of recent results with per-entry expiry.
#[derive(Debug)]
pub struct ResultCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl ResultCache {
    /// Creates a cache whose entries live for `ttl`. A zero `ttl` disables
    /// caching: every `get` misses and `set` is a no-op.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// The configured entry lifetime.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the cached value for `key` when one exists and has not
    /// expired. An expired entry is removed on the way out.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        if self.ttl.is_zero() {
            return None;
        }

        {
            let entries = self
                .entries
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            match entries.get(key) {
                None => return None,
                Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                    return Some(entry.value.clone());
                }
                Some(_) => {}
            }
        }

        // The entry was expired under the read lock; re-check under the
        // write lock in case a concurrent `set` refreshed it.
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get(key) {
            if entry.inserted_at.elapsed() >= self.ttl {
                entries.remove(key);
            } else {
                return Some(entry.value.clone());
            }
        }
        None
    }

    /// Inserts or overwrites the value for `key`, stamping it with the
    /// current time.
    pub fn set(&self, key: &str, value: Value) {
        if self.ttl.is_zero() {
            return;
        }
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Removes every expired entry.
    pub fn purge_expired(&self) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, entry| entry.inserted_at.elapsed() < self.ttl);
    }

    /// Number of entries currently held, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
