//! Topic -> shard registry.
//!
//! Topics are not owned by any single shard: each shard keeps the members it
//! holds, and this bucketed map records which shards currently hold at least
//! one member, with the last timestamp each shard touched the topic. Topic
//! scoped calls use it to visit only those shards, and its first-touch /
//! last-remove transitions are the global topic creations and deletions.

use std::sync::Arc;

use ahash::{AHashMap, RandomState};
use parking_lot::Mutex;

use castlite_core::Timestamp;

const BUCKETS: usize = 64;

type Bucket = AHashMap<Arc<str>, Vec<(usize, Timestamp)>>;

pub struct TopicRouter {
    buckets: Box<[Mutex<Bucket>]>,
    hasher: RandomState,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self {
            buckets: (0..BUCKETS).map(|_| Mutex::new(AHashMap::new())).collect(),
            hasher: RandomState::new(),
        }
    }

    fn bucket(&self, topic: &str) -> &Mutex<Bucket> {
        &self.buckets[(self.hasher.hash_one(topic) as usize) % BUCKETS]
    }

    /// Record that `shard` holds members of `topic` as of `ts`.
    ///
    /// The stored timestamp only moves forward. Returns true if the topic was
    /// not held by any shard before.
    pub fn touch(&self, topic: &Arc<str>, shard: usize, ts: Timestamp) -> bool {
        let mut bucket = self.bucket(topic).lock();
        match bucket.get_mut(&**topic) {
            Some(shards) => {
                match shards.iter_mut().find(|(s, _)| *s == shard) {
                    Some((_, last)) => *last = (*last).max(ts),
                    None => shards.push((shard, ts)),
                }
                false
            }
            None => {
                bucket.insert(Arc::clone(topic), vec![(shard, ts)]);
                true
            }
        }
    }

    /// Record that `shard` no longer holds members of `topic`.
    ///
    /// Called under the shard's own lock once its member set is empty.
    /// Returns true if no shard holds the topic any more.
    pub fn remove(&self, topic: &str, shard: usize) -> bool {
        let mut bucket = self.bucket(topic).lock();
        let Some(shards) = bucket.get_mut(topic) else {
            return false;
        };
        let Some(pos) = shards.iter().position(|(s, _)| *s == shard) else {
            return false;
        };
        shards.swap_remove(pos);
        if shards.is_empty() {
            bucket.remove(topic);
            true
        } else {
            false
        }
    }

    /// Shards currently holding members of `topic`, in ascending order.
    pub fn shards(&self, topic: &str) -> Vec<usize> {
        let mut shards: Vec<usize> = self
            .bucket(topic)
            .lock()
            .get(topic)
            .map(|shards| shards.iter().map(|(s, _)| *s).collect())
            .unwrap_or_default();
        shards.sort_unstable();
        shards
    }

    /// Last timestamp `shard` touched `topic`.
    pub fn last_seen(&self, topic: &str, shard: usize) -> Option<Timestamp> {
        self.bucket(topic)
            .lock()
            .get(topic)?
            .iter()
            .find(|(s, _)| *s == shard)
            .map(|(_, ts)| *ts)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.bucket(topic).lock().contains_key(topic)
    }

    /// Number of live topics.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }
}

impl Default for TopicRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(name: &str) -> Arc<str> {
        Arc::from(name)
    }

    #[test]
    fn test_first_touch_creates_last_remove_deletes() {
        let router = TopicRouter::new();
        let t = topic("news");

        assert!(router.touch(&t, 3, 10));
        assert!(!router.touch(&t, 1, 11));
        assert!(!router.touch(&t, 3, 12));
        assert_eq!(router.shards("news"), vec![1, 3]);

        assert!(!router.remove("news", 3));
        assert!(router.contains("news"));
        assert!(router.remove("news", 1));
        assert!(!router.contains("news"));
        assert_eq!(router.len(), 0);
    }

    #[test]
    fn test_touch_keeps_newest_timestamp() {
        let router = TopicRouter::new();
        let t = topic("news");
        router.touch(&t, 0, 20);
        router.touch(&t, 0, 5);
        assert_eq!(router.last_seen("news", 0), Some(20));
        router.touch(&t, 0, 30);
        assert_eq!(router.last_seen("news", 0), Some(30));
    }

    #[test]
    fn test_remove_non_last_entry_keeps_others() {
        let router = TopicRouter::new();
        let t = topic("news");
        router.touch(&t, 0, 1);
        router.touch(&t, 1, 2);
        router.touch(&t, 2, 3);

        assert!(!router.remove("news", 0));
        assert_eq!(router.shards("news"), vec![1, 2]);
        assert_eq!(router.last_seen("news", 2), Some(3));
        assert_eq!(router.last_seen("news", 1), Some(2));
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let router = TopicRouter::new();
        assert!(!router.remove("missing", 0));
        router.touch(&topic("t"), 0, 1);
        assert!(!router.remove("t", 5));
        assert_eq!(router.len(), 1);
    }
}
