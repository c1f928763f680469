use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// Bound on how long a reconciliation attempt waits for its turn.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
#[error("could not acquire transaction lock for {key} within {timeout:?}")]
pub struct LockTimeoutError {
    pub key: String,
    pub timeout: Duration,
}

struct Entry {
    lock: Arc<tokio::sync::Mutex<()>>,
    // holders plus waiters; the entry is evicted when this drops to zero
    interested: usize,
}

/// Per-key mutual exclusion for reconciliation attempts, keyed by provider
/// reference. Guarantees at most one attempt per reference runs at a time,
/// which is the defense against the webhook/poll double-delivery race.
///
/// Injected and explicitly owned by the application state rather than living
/// in a module-global registry, so a distributed lock can replace it without
/// touching call sites. In-process scope assumes a single-instance
/// deployment.
pub struct LockManager {
    entries: Mutex<HashMap<String, Entry>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` while holding the lock for `key`, waiting up to `timeout` to
    /// acquire it. The map entry is removed once the last interested party
    /// departs, bounding memory to the set of in-flight references.
    pub async fn with_lock<T, Fut, F>(
        &self,
        key: &str,
        timeout: Duration,
        f: F,
    ) -> Result<T, LockTimeoutError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.register(key);
        let _registration = Registration { manager: self, key };

        let result = match tokio::time::timeout(timeout, lock.lock()).await {
            Ok(_guard) => {
                debug!(key, "Transaction lock acquired");
                Ok(f().await)
            }
            Err(_) => Err(LockTimeoutError {
                key: key.to_string(),
                timeout,
            }),
        };
        result
    }

    /// Number of live lock entries, i.e. references with an attempt in
    /// flight or queued.
    pub fn active_keys(&self) -> usize {
        self.entries.lock().map(|m| m.len()).unwrap_or(0)
    }

    fn register(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            lock: Arc::new(tokio::sync::Mutex::new(())),
            interested: 0,
        });
        entry.interested += 1;
        entry.lock.clone()
    }

    fn unregister(&self, key: &str) {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(entry) = entries.get_mut(key) {
            entry.interested -= 1;
            if entry.interested == 0 {
                entries.remove(key);
            }
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the interest count on every exit path, including panics
/// inside the critical section and acquisition timeouts.
struct Registration<'a> {
    manager: &'a LockManager,
    key: &'a str,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.manager.unregister(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[tokio::test]
    async fn test_same_key_is_mutually_exclusive() {
        let manager = Arc::new(LockManager::new());
        let in_section = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let in_section = in_section.clone();
            let overlaps = overlaps.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .with_lock("ws_CO_1", Duration::from_secs(5), || async {
                        if in_section.swap(true, Ordering::SeqCst) {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        in_section.store(false, Ordering::SeqCst);
                    })
                    .await
                    .expect("lock acquired");
            }));
        }
        for handle in handles {
            handle.await.expect("task completes");
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_acquisition_times_out_while_held() {
        let manager = Arc::new(LockManager::new());

        let holder = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .with_lock("ws_CO_2", Duration::from_secs(5), || async {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    })
                    .await
                    .expect("holder acquires");
            })
        };

        // Give the holder a head start
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = manager
            .with_lock("ws_CO_2", Duration::from_millis(10), || async {})
            .await
            .expect_err("second acquisition should time out");
        assert_eq!(err.key, "ws_CO_2");

        holder.await.expect("holder completes");
    }

    #[tokio::test]
    async fn test_entries_are_evicted_after_release() {
        let manager = LockManager::new();

        manager
            .with_lock("ws_CO_3", Duration::from_secs(1), || async {})
            .await
            .expect("lock acquired");

        assert_eq!(manager.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_timed_out_waiter_does_not_leak_entry() {
        let manager = Arc::new(LockManager::new());

        let holder = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .with_lock("ws_CO_4", Duration::from_secs(5), || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    })
                    .await
                    .expect("holder acquires");
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = manager
            .with_lock("ws_CO_4", Duration::from_millis(5), || async {})
            .await;

        holder.await.expect("holder completes");
        assert_eq!(manager.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_proceed_in_parallel() {
        let manager = Arc::new(LockManager::new());

        let slow = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .with_lock("ws_CO_a", Duration::from_secs(5), || async {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    })
                    .await
                    .expect("slow acquires");
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;

        // A different reference must not queue behind ws_CO_a.
        manager
            .with_lock("ws_CO_b", Duration::from_millis(50), || async {})
            .await
            .expect("independent key acquires immediately");

        slow.await.expect("slow completes");
    }
}
