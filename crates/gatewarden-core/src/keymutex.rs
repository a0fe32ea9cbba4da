//! Keyed single-flight mutex.
//!
//! Verification of one subject must run at most once at a time, no matter
//! how many batch workers or concurrent requests name it. The cache alone
//! cannot give that guarantee: two concurrent misses would both start the
//! work. [`KeyMutex`] is the coordination primitive; the cache is an
//! amortization layer behind it.
//!
//! The global lock guards only the key table. The per-key wait happens on a
//! per-entry async mutex outside the global lock, so contention on one key
//! never stalls acquirers of another. Entries are reference-counted:
//! created on first acquire, removed when the last interested party (holder
//! or waiter, including cancelled waiters) goes away.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug)]
struct Entry {
    lock: Arc<AsyncMutex<()>>,
    waiters: usize,
}

#[derive(Debug, Default)]
struct Inner {
    entries: StdMutex<HashMap<String, Entry>>,
}

/// A map from key to lock handle with at most one holder per key.
#[derive(Debug, Clone, Default)]
pub struct KeyMutex {
    inner: Arc<Inner>,
}

impl KeyMutex {
    /// Creates an empty key mutex.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for `key`, waiting while another holder owns it.
    ///
    /// The returned guard is non-reentrant; acquiring the same key again on
    /// the same task deadlocks, exactly like a plain mutex.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let (lock, registration) = {
            let mut entries = self
                .inner
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                lock: Arc::new(AsyncMutex::new(())),
                waiters: 0,
            });
            entry.waiters += 1;
            (
                Arc::clone(&entry.lock),
                Registration {
                    key: key.to_string(),
                    inner: Arc::clone(&self.inner),
                },
            )
        };

        // If the caller is cancelled while parked here, dropping
        // `registration` releases its slot in the table.
        let guard = lock.lock_owned().await;
        KeyGuard {
            _guard: guard,
            _registration: registration,
        }
    }

    /// Number of keys currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no key is currently tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Accounts for one holder or waiter of a key; the table entry is removed
/// when the count drops to zero.
#[derive(Debug)]
struct Registration {
    key: String,
    inner: Arc<Inner>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut entries = self
            .inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(&self.key) {
            entry.waiters -= 1;
            if entry.waiters == 0 {
                entries.remove(&self.key);
            }
        }
    }
}

/// Exclusive hold on one key. Dropping it releases the key.
#[derive(Debug)]
pub struct KeyGuard {
    // Field order matters: the mutex is released before the registration
    // drops the table entry.
    _guard: OwnedMutexGuard<()>,
    _registration: Registration,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn lock_excludes_second_holder() {
        let mutex = KeyMutex::new();
        let guard = mutex.lock("ver:a").await;

        let contended = {
            let mutex = mutex.clone();
            tokio::spawn(async move {
                let _guard = mutex.lock("ver:a").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contended.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contended)
            .await
            .expect("waiter should acquire after release")
            .unwrap();
    }

    #[tokio::test]
    async fn distinct_keys_do_not_contend() {
        let mutex = KeyMutex::new();
        let _a = mutex.lock("ver:a").await;
        // Completes immediately despite `ver:a` being held.
        tokio::time::timeout(Duration::from_millis(100), mutex.lock("ver:b"))
            .await
            .expect("distinct key should not block");
    }

    #[tokio::test]
    async fn holders_of_one_key_are_serialized() {
        let mutex = KeyMutex::new();
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let mutex = mutex.clone();
                let running = Arc::clone(&running);
                let max_seen = Arc::clone(&max_seen);
                tokio::spawn(async move {
                    let _guard = mutex.lock("ver:a").await;
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn entry_removed_when_last_holder_drops() {
        let mutex = KeyMutex::new();
        {
            let _a = mutex.lock("ver:a").await;
            assert_eq!(mutex.len(), 1);
        }
        assert!(mutex.is_empty());
    }

    #[tokio::test]
    async fn cancelled_waiter_releases_its_slot() {
        let mutex = KeyMutex::new();
        let guard = mutex.lock("ver:a").await;

        let waiter = {
            let mutex = mutex.clone();
            tokio::spawn(async move {
                let _guard = mutex.lock("ver:a").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter.abort();
        let _ = waiter.await;

        drop(guard);
        // Only the entries of live holders remain.
        assert!(mutex.is_empty());
    }
}
