//! Per-key serialization and retry backoff for the controller shell

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async lock per key; different keys never contend
#[derive(Default)]
pub struct KeyMutex {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held while a key is being processed
pub struct KeyGuard {
    _guard: OwnedMutexGuard<()>,
}

impl KeyMutex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyGuard {
        let lock = {
            let mut locks = self.locks.lock();
            locks.entry(key.to_string()).or_default().clone()
        };
        KeyGuard {
            _guard: lock.lock_owned().await,
        }
    }

    /// Drop the lock of a key nobody holds or waits for
    pub fn forget(&self, key: &str) {
        let mut locks = self.locks.lock();
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exponential per-key retry delay: `base * 2^failures`, capped at `max`
pub struct RetryBackoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl RetryBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure of `key` and return how long to wait before retrying
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock();
        let count = failures.entry(key.to_string()).or_insert(0);
        let exponent = (*count).min(31);
        *count = count.saturating_add(1);

        let base = self.base.as_millis() as u64;
        let delay_ms = base
            .saturating_mul(2u64.pow(exponent))
            .min(self.max.as_millis() as u64);
        Duration::from_millis(delay_ms)
    }

    /// Reset `key` after a successful pass
    pub fn forget(&self, key: &str) {
        self.failures.lock().remove(key);
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }
}
