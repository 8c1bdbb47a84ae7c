//! Inactive client eviction.
//!
//! Each shard keeps one collector. A client that goes inactive is recorded
//! with its inactivation timestamp; reconnecting clears the record. A
//! periodic sweep hands every record older than the TTL back to the shard,
//! which removes the client for good.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use parking_lot::Mutex;

use castlite_core::Timestamp;

pub struct GarbageCollector {
    ttl: Timestamp,
    entries: Mutex<AHashMap<Arc<str>, Timestamp>>,
}

impl GarbageCollector {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: Timestamp::try_from(ttl.as_nanos()).unwrap_or(Timestamp::MAX),
            entries: Mutex::new(AHashMap::new()),
        }
    }

    /// Record `key` as inactive since `ts`. No-op unless newer than the stored record.
    pub fn add(&self, key: &Arc<str>, ts: Timestamp) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&**key) {
            Some(stored) if *stored >= ts => false,
            Some(stored) => {
                *stored = ts;
                true
            }
            None => {
                entries.insert(Arc::clone(key), ts);
                true
            }
        }
    }

    /// Clear the record for `key` if it is older than `ts`.
    pub fn delete(&self, key: &str, ts: Timestamp) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(stored) if *stored < ts => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Forget `key` regardless of timestamps.
    pub fn remove(&self, key: &str) -> Option<Timestamp> {
        self.entries.lock().remove(key)
    }

    /// Invoke `callback` for every key inactive for at least the TTL as of
    /// `now`, forgetting it first. The callback runs without the collector lock.
    pub fn collect<F>(&self, now: Timestamp, mut callback: F) -> usize
    where
        F: FnMut(&Arc<str>, Timestamp),
    {
        let expired: Vec<(Arc<str>, Timestamp)> = {
            let mut entries = self.entries.lock();
            let expired: Vec<_> = entries
                .iter()
                .filter(|(_, ts)| now.saturating_sub(**ts) >= self.ttl)
                .map(|(key, ts)| (Arc::clone(key), *ts))
                .collect();
            for (key, _) in &expired {
                entries.remove(key);
            }
            expired
        };

        for (key, ts) in &expired {
            callback(key, *ts);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: Timestamp = 1_000_000_000;

    fn key(name: &str) -> Arc<str> {
        Arc::from(name)
    }

    #[test]
    fn test_collect_respects_ttl() {
        let gc = GarbageCollector::new(Duration::from_secs(10));
        gc.add(&key("c1"), 100 * SEC);

        let mut evicted = Vec::new();
        assert_eq!(gc.collect(110 * SEC - 1, |k, _| evicted.push(k.clone())), 0);
        assert!(evicted.is_empty());

        assert_eq!(gc.collect(110 * SEC, |k, _| evicted.push(k.clone())), 1);
        assert_eq!(evicted, vec![key("c1")]);
        assert!(gc.is_empty(), "collected keys are forgotten");
    }

    #[test]
    fn test_add_and_delete_are_last_write_wins() {
        let gc = GarbageCollector::new(Duration::from_secs(1));
        assert!(gc.add(&key("c1"), 10));
        assert!(!gc.add(&key("c1"), 10));
        assert!(!gc.add(&key("c1"), 5));

        assert!(!gc.delete("c1", 10), "delete must be strictly newer");
        assert!(gc.delete("c1", 11));
        assert!(gc.is_empty());
    }

    #[test]
    fn test_newer_inactivation_postpones_eviction() {
        let gc = GarbageCollector::new(Duration::from_secs(10));
        gc.add(&key("c1"), 0);
        gc.add(&key("c1"), 5 * SEC);
        assert_eq!(gc.collect(12 * SEC, |_, _| {}), 0);
        assert_eq!(gc.collect(15 * SEC, |_, ts| assert_eq!(ts, 5 * SEC)), 1);
    }

    #[test]
    fn test_remove_ignores_timestamps() {
        let gc = GarbageCollector::new(Duration::from_secs(1));
        gc.add(&key("c1"), 50);
        assert_eq!(gc.remove("c1"), Some(50));
        assert_eq!(gc.remove("c1"), None);
    }
}
