use std::sync::Mutex;
use std::time::Duration;

use rustc_hash::FxHashMap;

/// Per-object exponential backoff for transient failures.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempts: Mutex<FxHashMap<String, u32>>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(300))
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, attempts: Mutex::new(FxHashMap::default()) }
    }

    /// Delay before the next retry of `key`; doubles with every call.
    pub fn next(&self, key: &str) -> Duration {
        let attempt = match self.attempts.lock() {
            Ok(mut map) => {
                let n = map.entry(key.to_string()).or_insert(0);
                let current = *n;
                *n = n.saturating_add(1);
                current
            }
            Err(_) => 0,
        };
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&self, key: &str) {
        if let Ok(mut map) = self.attempts.lock() {
            map.remove(key);
        }
    }
}
