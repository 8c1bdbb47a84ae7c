//! Per-entity subscription list with last-write-wins timestamps.
//!
//! Both clients and users own one. The list is not synchronized; it is
//! always mutated under the owning shard's lock.

use std::sync::Arc;

use ahash::AHashMap;

use crate::time::Timestamp;

/// A single subscription record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: Arc<str>,
    pub active: bool,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Copy)]
struct Record {
    active: bool,
    timestamp: Timestamp,
}

/// Map of topic -> {active, timestamp}.
///
/// An update is applied only when it is strictly newer than the stored
/// record, so replays of the same operation are idempotent and an
/// unsubscribe (tombstone) blocks any older subscribe that arrives late.
#[derive(Debug, Default, Clone)]
pub struct SubscriptionList {
    records: AHashMap<Arc<str>, Record>,
}

impl SubscriptionList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate `topic` at `ts`. Returns false if a record at least as new exists.
    pub fn add(&mut self, topic: &Arc<str>, ts: Timestamp) -> bool {
        self.apply(topic, true, ts)
    }

    /// Deactivate `topic` at `ts`, leaving a tombstone.
    /// Returns false if a record at least as new exists.
    pub fn delete(&mut self, topic: &Arc<str>, ts: Timestamp) -> bool {
        self.apply(topic, false, ts)
    }

    fn apply(&mut self, topic: &Arc<str>, active: bool, ts: Timestamp) -> bool {
        match self.records.get_mut(topic) {
            Some(record) if record.timestamp >= ts => false,
            Some(record) => {
                record.active = active;
                record.timestamp = ts;
                true
            }
            None => {
                self.records
                    .insert(Arc::clone(topic), Record { active, timestamp: ts });
                true
            }
        }
    }

    /// Whether `topic` is currently active.
    pub fn is_active(&self, topic: &str) -> bool {
        self.records.get(topic).is_some_and(|r| r.active)
    }

    /// Stored record for `topic`, tombstones included.
    pub fn get(&self, topic: &str) -> Option<Subscription> {
        self.records.get_key_value(topic).map(|(t, r)| Subscription {
            topic: Arc::clone(t),
            active: r.active,
            timestamp: r.timestamp,
        })
    }

    /// Iterate over all records, tombstones included.
    pub fn iter(&self) -> impl Iterator<Item = Subscription> + '_ {
        self.records.iter().map(|(topic, r)| Subscription {
            topic: Arc::clone(topic),
            active: r.active,
            timestamp: r.timestamp,
        })
    }

    /// Iterate over active subscriptions only.
    pub fn active(&self) -> impl Iterator<Item = Subscription> + '_ {
        self.iter().filter(|s| s.active)
    }

    /// Number of active subscriptions.
    pub fn active_count(&self) -> usize {
        self.records.values().filter(|r| r.active).count()
    }

    /// Number of records, tombstones included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(name: &str) -> Arc<str> {
        Arc::from(name)
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut list = SubscriptionList::new();
        let t = topic("news");

        assert!(list.add(&t, 10));
        assert!(!list.add(&t, 10), "same timestamp must be a no-op");
        assert!(list.is_active("news"));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_older_add_after_newer_is_noop() {
        let mut list = SubscriptionList::new();
        let t = topic("news");

        assert!(list.add(&t, 20));
        assert!(!list.add(&t, 5));
        assert_eq!(list.get("news").unwrap().timestamp, 20);
    }

    #[test]
    fn test_tombstone_blocks_older_activation() {
        let mut list = SubscriptionList::new();
        let t = topic("news");

        assert!(list.delete(&t, 30));
        assert!(!list.is_active("news"));
        assert!(!list.add(&t, 25), "tombstone at 30 must block add at 25");
        assert!(list.add(&t, 31));
        assert!(list.is_active("news"));
    }

    #[test]
    fn test_subscribe_then_unsubscribe() {
        let mut list = SubscriptionList::new();
        let t = topic("news");

        list.add(&t, 1);
        assert!(list.delete(&t, 2));
        assert_eq!(list.active_count(), 0);
        assert_eq!(list.len(), 1, "tombstone is kept");
    }

    #[test]
    fn test_active_iterator_skips_tombstones() {
        let mut list = SubscriptionList::new();
        list.add(&topic("a"), 1);
        list.add(&topic("b"), 1);
        list.delete(&topic("c"), 1);

        let mut active: Vec<_> = list.active().map(|s| s.topic.to_string()).collect();
        active.sort();
        assert_eq!(active, vec!["a", "b"]);
        assert_eq!(list.iter().count(), 3);
    }
}
