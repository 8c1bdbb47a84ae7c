//! Session/group fan-out and the flush worker pool.
//!
//! The [`Broadcaster`] owns every [`Session`] and [`Group`]. Engine shards
//! never touch them directly: they record intents on a [`Mutator`], and
//! publishes go through [`Broadcaster::broadcast`]. A unit that goes from
//! idle to having undelivered data is put on a single bounded work queue
//! exactly once; flush workers pop units and write encoded frames to the
//! client transports.

mod group;
mod mutator;
mod session;

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet, RandomState};
use bytes::Bytes;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use crossbeam_queue::ArrayQueue;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use castlite_core::{BatchEncoder, Error, GroupKey, Message, Result, Timestamp};

use crate::config::BroadcastConfig;
use crate::metrics::EngineMetrics;
use crate::transport::Transport;

pub use group::Group;
pub use mutator::{CommitReport, Mutation, Mutator};
pub use session::{Session, UpdateOutcome};

/// Lock stripes for the session and group registries.
const STRIPES: usize = 64;

/// Idle mutator op buffers kept for reuse.
const MUTATOR_POOL_CAPACITY: usize = 256;

/// Minimum gap between write failure log lines per worker.
const WRITE_FAILURE_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Broadcaster-internal handle of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Work queue item.
pub(crate) enum FlushUnit {
    Session(Arc<Session>),
    Group(Arc<Group>),
}

impl FlushUnit {
    fn flush(&self, ctx: &mut FlushContext) {
        match self {
            FlushUnit::Session(session) => session.flush(ctx),
            FlushUnit::Group(group) => group.flush(ctx),
        }
    }
}

/// Writes frames to transports, counting bytes and failures.
///
/// The first write failure is logged at once. Later ones are folded into a
/// single line per `log_interval`, so a dead subscriber cannot flood the log.
pub(crate) struct WriteSink {
    metrics: Arc<EngineMetrics>,
    log_interval: Duration,
    last_logged: Option<Instant>,
    suppressed: u64,
}

impl WriteSink {
    fn new(metrics: Arc<EngineMetrics>, log_interval: Duration) -> Self {
        Self {
            metrics,
            log_interval,
            last_logged: None,
            suppressed: 0,
        }
    }

    /// Write `frames` in order, stopping at the first failure.
    pub(crate) fn write(&mut self, writer: &dyn Transport, frames: &[Bytes], client: &str) {
        for frame in frames {
            if let Err(e) = writer.write(frame) {
                self.metrics.add_write_error();
                match self.failure() {
                    Some(0) => warn!("Transport write failed for {}: {}", client, e),
                    Some(skipped) => warn!(
                        "Transport write failed for {}: {} ({} more failures since last report)",
                        client, e, skipped
                    ),
                    None => {}
                }
                return;
            }
            self.metrics.add_frame_written(frame.len());
        }
    }

    /// Record a failure. Returns the number of failures suppressed since the
    /// last report if this one should be logged.
    fn failure(&mut self) -> Option<u64> {
        let due = self
            .last_logged
            .map_or(true, |at| at.elapsed() >= self.log_interval);
        if !due {
            self.suppressed += 1;
            return None;
        }
        self.last_logged = Some(Instant::now());
        Some(std::mem::take(&mut self.suppressed))
    }
}

/// Per-worker scratch state. Never shared between workers.
pub(crate) struct FlushContext {
    pub(crate) encoder: BatchEncoder,
    pub(crate) sink: WriteSink,
    /// Reused member list for group fan-out, with join timestamps.
    pub(crate) members: Vec<(Arc<Session>, Timestamp)>,
}

impl FlushContext {
    pub(crate) fn new(max_batch_size: usize, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            encoder: BatchEncoder::new(max_batch_size),
            sink: WriteSink::new(metrics, WRITE_FAILURE_LOG_INTERVAL),
            members: Vec::new(),
        }
    }
}

struct SessionEntry {
    session: Arc<Session>,
    /// Groups this session is an active member of.
    groups: AHashSet<GroupKey>,
}

pub struct Broadcaster {
    config: BroadcastConfig,
    history_capacity: usize,
    metrics: Arc<EngineMetrics>,
    next_session: AtomicU64,
    sessions: Box<[RwLock<AHashMap<SessionId, SessionEntry>>]>,
    groups: Box<[RwLock<AHashMap<GroupKey, Arc<Group>>>]>,
    hasher: RandomState,
    queue_tx: Sender<FlushUnit>,
    queue_rx: Receiver<FlushUnit>,
    /// Dropped on shutdown; workers and blocked producers select on it.
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pool: ArrayQueue<Vec<Mutation>>,
}

impl Broadcaster {
    pub fn new(
        config: &BroadcastConfig,
        history_capacity: usize,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let (queue_tx, queue_rx) = bounded(config.queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = bounded(0);
        Self {
            config: config.clone(),
            history_capacity,
            metrics,
            next_session: AtomicU64::new(1),
            sessions: (0..STRIPES).map(|_| RwLock::new(AHashMap::new())).collect(),
            groups: (0..STRIPES).map(|_| RwLock::new(AHashMap::new())).collect(),
            hasher: RandomState::new(),
            queue_tx,
            queue_rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            workers: Mutex::new(Vec::new()),
            pool: ArrayQueue::new(MUTATOR_POOL_CAPACITY),
        }
    }

    /// Spawn the flush workers. Calling it again is a no-op.
    pub fn start(&self) -> io::Result<()> {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return Ok(());
        }

        let count = self.config.worker_count();
        for id in 0..count {
            let rx = self.queue_rx.clone();
            let shutdown = self.shutdown_rx.clone();
            let ctx = FlushContext::new(self.config.max_batch_size, Arc::clone(&self.metrics));

            let handle = thread::Builder::new()
                .name(format!("castlite-flush-{}", id))
                .spawn(move || run_worker(id, rx, shutdown, ctx))?;
            workers.push(handle);
        }

        info!("Spawned {} flush workers", count);
        Ok(())
    }

    /// Stop the workers without draining the queue and unblock producers.
    pub fn shutdown(&self) {
        drop(self.shutdown_tx.lock().take());

        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() != current && handle.join().is_err() {
                warn!("Flush worker panicked");
            }
        }
    }

    /// Flush units waiting in the work queue.
    pub fn queue_depth(&self) -> usize {
        self.queue_tx.len()
    }

    /// Allocate a handle for a new client session.
    pub fn next_session_id(&self) -> SessionId {
        SessionId(self.next_session.fetch_add(1, Ordering::Relaxed))
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.session_stripe(id)
            .read()
            .get(&id)
            .map(|entry| Arc::clone(&entry.session))
    }

    pub fn group(&self, key: &GroupKey) -> Option<Arc<Group>> {
        self.group_stripe(key).read().get(key).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.iter().map(|s| s.read().len()).sum()
    }

    pub fn group_count(&self) -> usize {
        self.groups.iter().map(|g| g.read().len()).sum()
    }

    /// Push `messages` to each existing session and group.
    ///
    /// Unknown targets are skipped. Blocks while the work queue is full.
    pub fn broadcast(
        &self,
        sessions: &[SessionId],
        groups: &[GroupKey],
        messages: &[Message],
    ) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        for &id in sessions {
            if let Some(session) = self.session(id) {
                if session.push(messages) {
                    self.enqueue(FlushUnit::Session(session))?;
                }
            }
        }
        for key in groups {
            if let Some(group) = self.group(key) {
                if group.push(messages) {
                    self.enqueue(FlushUnit::Group(group))?;
                }
            }
        }
        Ok(())
    }

    /// Open a batch of membership intents, all stamped with `ts`.
    pub fn mutator(&self, ts: Timestamp) -> Mutator<'_> {
        let ops = self.pool.pop().unwrap_or_default();
        Mutator::new(self, ts, ops)
    }

    fn recycle(&self, mut ops: Vec<Mutation>) {
        ops.clear();
        let _ = self.pool.push(ops);
    }

    /// Send a unit to the workers, blocking while the queue is full.
    fn enqueue(&self, unit: FlushUnit) -> Result<()> {
        select! {
            send(self.queue_tx, unit) -> res => res.map_err(|_| Error::Closed),
            recv(self.shutdown_rx) -> _ => Err(Error::Closed),
        }
    }

    fn session_stripe(&self, id: SessionId) -> &RwLock<AHashMap<SessionId, SessionEntry>> {
        &self.sessions[(id.0 as usize) % STRIPES]
    }

    fn group_stripe(&self, key: &GroupKey) -> &RwLock<AHashMap<GroupKey, Arc<Group>>> {
        &self.groups[(self.hasher.hash_one(key) as usize) % STRIPES]
    }

    // === Mutator commit steps ===

    fn update_session(
        &self,
        id: SessionId,
        client: &Arc<str>,
        writer: Option<Arc<dyn Transport>>,
        ts: Timestamp,
        report: &mut CommitReport,
    ) -> Result<()> {
        let session = {
            let mut stripe = self.session_stripe(id).write();
            let entry = stripe.entry(id).or_insert_with(|| SessionEntry {
                session: Arc::new(Session::new(
                    id,
                    Arc::clone(client),
                    self.config.max_session_buffer,
                    Arc::clone(&self.metrics),
                )),
                groups: AHashSet::new(),
            });
            Arc::clone(&entry.session)
        };

        let outcome = session.update(writer, ts);
        report.unrecoverable.extend(outcome.lost);
        if outcome.enqueue {
            self.enqueue(FlushUnit::Session(session))?;
        }
        Ok(())
    }

    fn delete_session(&self, id: SessionId) {
        let Some(entry) = self.session_stripe(id).write().remove(&id) else {
            return;
        };
        for key in &entry.groups {
            self.remove_member(key, id, 0, true);
        }
        entry.session.close();
    }

    fn join(&self, id: SessionId, key: GroupKey, ts: Timestamp) {
        let mut sessions = self.session_stripe(id).write();
        let Some(entry) = sessions.get_mut(&id) else {
            debug!("Join of {} ignored: session {} is gone", key, id);
            return;
        };

        let mut groups = self.group_stripe(&key).write();
        let group = groups
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Group::new(key.clone(), self.history_capacity)));
        if group.add(&entry.session, ts) {
            entry.groups.insert(key);
        }
    }

    fn leave(&self, id: SessionId, key: &GroupKey, ts: Timestamp) {
        let mut sessions = self.session_stripe(id).write();
        let (ended, history_id) = self.remove_member(key, id, ts, false);
        if !ended {
            return;
        }
        if let Some(entry) = sessions.get_mut(&id) {
            entry.groups.remove(key);
            entry.session.forget(key, history_id);
        }
    }

    /// Remove a member and drop the group once nobody is left in it.
    fn remove_member(
        &self,
        key: &GroupKey,
        id: SessionId,
        ts: Timestamp,
        forced: bool,
    ) -> (bool, Option<u64>) {
        let mut groups = self.group_stripe(key).write();
        let Some(group) = groups.get(key) else {
            return (false, None);
        };

        let ended = group.delete(id, ts, forced);
        let history_id = group.history_id();
        if group.active_members() == 0 {
            if let Some(group) = groups.remove(key) {
                group.close();
            }
        }
        (ended, history_id)
    }

    /// Flush everything currently queued on the calling thread.
    #[cfg(test)]
    pub(crate) fn run_pending(&self) -> usize {
        let mut ctx = FlushContext::new(self.config.max_batch_size, Arc::clone(&self.metrics));
        let mut count = 0;
        while let Ok(unit) = self.queue_rx.try_recv() {
            unit.flush(&mut ctx);
            count += 1;
        }
        count
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(id: usize, rx: Receiver<FlushUnit>, shutdown: Receiver<()>, mut ctx: FlushContext) {
    loop {
        select! {
            recv(rx) -> unit => match unit {
                Ok(unit) => unit.flush(&mut ctx),
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
        }
    }
    debug!("Flush worker {} stopped", id);
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::Receiver;

    use super::*;
    use crate::transport::{drain_payloads, ChannelTransport};

    fn broadcaster(history: usize) -> Broadcaster {
        let config = BroadcastConfig {
            workers: 2,
            queue_capacity: 64,
            ..Default::default()
        };
        Broadcaster::new(&config, history, Arc::new(EngineMetrics::new()))
    }

    fn connect(b: &Broadcaster, name: &str, ts: Timestamp) -> (SessionId, Receiver<Bytes>) {
        let id = b.next_session_id();
        let (transport, rx) = ChannelTransport::unbounded();
        let mut m = b.mutator(ts);
        m.update_client(id, Arc::from(name), Some(transport as Arc<dyn Transport>));
        m.commit().unwrap();
        (id, rx)
    }

    #[test]
    fn test_first_write_failure_reported_then_limited() {
        let metrics = Arc::new(EngineMetrics::new());
        let mut sink = WriteSink::new(Arc::clone(&metrics), Duration::from_secs(3600));
        assert_eq!(sink.failure(), Some(0));
        assert_eq!(sink.failure(), None);
        assert_eq!(sink.failure(), None);

        let mut sink = WriteSink::new(metrics, Duration::ZERO);
        assert_eq!(sink.failure(), Some(0));
        assert_eq!(sink.failure(), Some(0));
    }

    #[test]
    fn test_failed_write_stops_and_counts() {
        let metrics = Arc::new(EngineMetrics::new());
        let mut sink = WriteSink::new(Arc::clone(&metrics), Duration::from_secs(3600));
        let (transport, rx) = ChannelTransport::unbounded();
        drop(rx);

        let frames = [Bytes::from_static(b"a"), Bytes::from_static(b"b")];
        sink.write(&*transport, &frames, "c1");
        sink.write(&*transport, &frames, "c1");

        let snapshot = metrics.snapshot(0);
        assert_eq!(snapshot.write_errors, 2);
        assert_eq!(snapshot.frames_written, 0);
        assert_eq!(sink.suppressed, 1);
    }

    #[test]
    fn test_broadcast_to_session_and_topic() {
        let b = broadcaster(8);
        let (s1, rx1) = connect(&b, "c1", 1);
        let (s2, rx2) = connect(&b, "c2", 1);

        let mut m = b.mutator(2);
        m.subscribe(s2, Arc::from("t"));
        m.commit().unwrap();

        b.broadcast(&[s1], &[], &[Message::new("direct")]).unwrap();
        b.broadcast(&[], &[GroupKey::topic("t")], &[Message::new("topic")])
            .unwrap();
        assert_eq!(b.queue_depth(), 2);
        assert_eq!(b.run_pending(), 2);

        assert_eq!(drain_payloads(&rx1).unwrap(), vec![Bytes::from("direct")]);
        assert_eq!(drain_payloads(&rx2).unwrap(), vec![Bytes::from("topic")]);
    }

    #[test]
    fn test_unit_enqueued_once_per_transition() {
        let b = broadcaster(8);
        let (s1, rx1) = connect(&b, "c1", 1);

        for i in 0..10 {
            b.broadcast(&[s1], &[], &[Message::new(i.to_string())]).unwrap();
        }
        assert_eq!(b.queue_depth(), 1);
        b.run_pending();
        assert_eq!(drain_payloads(&rx1).unwrap().len(), 10);
    }

    #[test]
    fn test_group_removed_when_last_member_leaves() {
        let b = broadcaster(8);
        let (s1, _rx) = connect(&b, "c1", 1);

        let mut m = b.mutator(2);
        m.subscribe(s1, Arc::from("t"));
        m.commit().unwrap();
        assert!(b.group(&GroupKey::topic("t")).is_some());

        let mut m = b.mutator(3);
        m.unsubscribe(s1, Arc::from("t"));
        m.commit().unwrap();
        assert!(b.group(&GroupKey::topic("t")).is_none());
    }

    #[test]
    fn test_delete_client_purges_memberships() {
        let b = broadcaster(8);
        let (s1, _rx) = connect(&b, "c1", 1);
        let (s2, _rx2) = connect(&b, "c2", 1);

        let mut m = b.mutator(2);
        m.subscribe(s1, Arc::from("t"));
        m.subscribe(s2, Arc::from("t"));
        m.attach_user(s1, Arc::from("u"));
        m.commit().unwrap();

        let mut m = b.mutator(3);
        m.delete_client(s1);
        m.commit().unwrap();

        assert!(b.session(s1).is_none());
        assert!(b.group(&GroupKey::user("u")).is_none());
        let topic = b.group(&GroupKey::topic("t")).unwrap();
        assert_eq!(topic.active_members(), 1);
        assert_eq!(b.session_count(), 1);
    }

    #[test]
    fn test_workers_deliver_and_shutdown_unblocks() {
        let b = broadcaster(8);
        b.start().unwrap();
        let (s1, rx1) = connect(&b, "c1", 1);

        b.broadcast(&[s1], &[], &[Message::new("x")]).unwrap();
        let frame = rx1.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(castlite_core::decode_frame(&frame).unwrap(), vec![Bytes::from("x")]);

        b.shutdown();
        assert!(matches!(b.enqueue_probe(s1), Err(Error::Closed)));
    }

    impl Broadcaster {
        /// Enqueue a session unit directly, bypassing the idle check.
        fn enqueue_probe(&self, id: SessionId) -> Result<()> {
            let session = self.session(id).unwrap();
            // Fill the queue so only the shutdown arm can fire.
            while self.queue_tx.try_send(FlushUnit::Session(Arc::clone(&session))).is_ok() {}
            self.enqueue(FlushUnit::Session(session))
        }
    }
}
