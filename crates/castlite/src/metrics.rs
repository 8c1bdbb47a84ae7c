//! Engine counters and gauges.
//!
//! Counters are bumped on the hot path with relaxed atomics. Registry gauges
//! are not maintained by the shards themselves: every public call applies its
//! [`ChangeLog`] here, which is exactly what an external metrics collector
//! consuming change logs would compute.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use castlite_core::ChangeLog;

/// Atomic counters shared by shards and flush workers.
#[derive(Debug)]
pub struct EngineMetrics {
    // Delivery
    pub messages_published: AtomicU64,
    pub frames_written: AtomicU64,
    pub bytes_written: AtomicU64,
    pub write_errors: AtomicU64,
    /// Messages evicted from capped offline buffers.
    pub messages_dropped: AtomicU64,

    // Replay
    pub replays_served: AtomicU64,
    pub replays_expired: AtomicU64,

    // Registry gauges (fed from change logs)
    pub clients: AtomicI64,
    pub users: AtomicI64,
    pub topics: AtomicI64,
    pub clients_evicted: AtomicU64,
}

impl EngineMetrics {
    pub const fn new() -> Self {
        Self {
            messages_published: AtomicU64::new(0),
            frames_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            replays_served: AtomicU64::new(0),
            replays_expired: AtomicU64::new(0),
            clients: AtomicI64::new(0),
            users: AtomicI64::new(0),
            topics: AtomicI64::new(0),
            clients_evicted: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn add_messages_published(&self, n: u64) {
        self.messages_published.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_frame_written(&self, bytes: usize) {
        self.frames_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_messages_dropped(&self, n: u64) {
        self.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_replay_served(&self) {
        self.replays_served.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_replay_expired(&self) {
        self.replays_expired.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_clients_evicted(&self, n: u64) {
        self.clients_evicted.fetch_add(n, Ordering::Relaxed);
    }

    /// Fold one call's change log into the registry gauges.
    pub fn apply(&self, log: &ChangeLog) {
        fn delta(gauge: &AtomicI64, up: usize, down: usize) {
            let d = up as i64 - down as i64;
            if d != 0 {
                gauge.fetch_add(d, Ordering::Relaxed);
            }
        }

        delta(&self.clients, log.clients_created.len(), log.clients_deleted.len());
        delta(&self.users, log.users_created.len(), log.users_deleted.len());
        delta(&self.topics, log.topics_created.len(), log.topics_deleted.len());
    }

    /// Plain copy of every counter. `queue_depth` is sampled by the caller.
    pub fn snapshot(&self, queue_depth: usize) -> MetricsSnapshot {
        let gauge = |g: &AtomicI64| g.load(Ordering::Relaxed).max(0) as u64;
        MetricsSnapshot {
            clients: gauge(&self.clients),
            users: gauge(&self.users),
            topics: gauge(&self.topics),
            queue_depth,
            messages_published: self.messages_published.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            replays_served: self.replays_served.load(Ordering::Relaxed),
            replays_expired: self.replays_expired.load(Ordering::Relaxed),
            clients_evicted: self.clients_evicted.load(Ordering::Relaxed),
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view returned by `Engine::metrics`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub clients: u64,
    pub users: u64,
    pub topics: u64,
    /// Flush units waiting in the work queue.
    pub queue_depth: usize,
    pub messages_published: u64,
    pub frames_written: u64,
    pub bytes_written: u64,
    pub write_errors: u64,
    pub messages_dropped: u64,
    pub replays_served: u64,
    pub replays_expired: u64,
    pub clients_evicted: u64,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_apply_changelog_moves_gauges() {
        let metrics = EngineMetrics::new();
        let mut log = ChangeLog::new();
        log.clients_created.push(Arc::from("c1"));
        log.clients_created.push(Arc::from("c2"));
        log.topics_created.push(Arc::from("t"));
        metrics.apply(&log);

        let mut log = ChangeLog::new();
        log.clients_deleted.push(Arc::from("c1"));
        log.clients_inactivated.push(Arc::from("c2"));
        metrics.apply(&log);

        let snap = metrics.snapshot(3);
        assert_eq!(snap.clients, 1);
        assert_eq!(snap.topics, 1);
        assert_eq!(snap.users, 0);
        assert_eq!(snap.queue_depth, 3);
    }

    #[test]
    fn test_counters() {
        let metrics = EngineMetrics::new();
        metrics.add_frame_written(10);
        metrics.add_frame_written(5);
        metrics.add_write_error();

        let snap = metrics.snapshot(0);
        assert_eq!(snap.frames_written, 2);
        assert_eq!(snap.bytes_written, 15);
        assert_eq!(snap.write_errors, 1);
    }
}
