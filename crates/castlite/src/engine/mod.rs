//! Public engine API and the sharding/dispatch layer.
//!
//! Clients and users are owned by the shard their id hashes to. Every public
//! call stamps its timestamp once, splits its targets per shard, runs the
//! shard operations in ascending shard order and merges what they report into
//! a single [`ChangeLog`]. Steps that cross shards (user membership, user
//! subscription propagation) are chained here with the same timestamp.

mod options;
mod router;
mod shard;

use std::collections::BTreeMap;
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ahash::RandomState;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;

use castlite_core::time::stamp;
use castlite_core::{
    now, ChangeLog, EntityKind, Error, GroupKey, Message, Result, Timestamp, MAX_PAYLOAD_SIZE,
};

use crate::broadcast::Broadcaster;
use crate::config::Config;
use crate::gc::GarbageCollector;
use crate::metrics::{EngineMetrics, MetricsSnapshot};

pub use options::{ConnectOptions, Options};
pub use shard::{ClientInfo, ClientStatus, UserInfo};

use router::TopicRouter;
use shard::{Removed, Shard};

/// Fixed hasher seeds so every instance maps an id to the same shard.
const SHARD_SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

struct Sweeper {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// The broadcast engine.
pub struct Engine {
    shards: Box<[Shard]>,
    router: Arc<TopicRouter>,
    broadcaster: Arc<Broadcaster>,
    metrics: Arc<EngineMetrics>,
    hasher: RandomState,
    gc_interval: Option<Duration>,
    closed: AtomicBool,
    sweeper: Mutex<Option<Sweeper>>,
}

impl Engine {
    /// Build an engine from configuration. No threads run until [`Engine::start`].
    pub fn new(config: &Config) -> Self {
        let metrics = Arc::new(EngineMetrics::new());
        let broadcaster = Arc::new(Broadcaster::new(
            &config.broadcast,
            config.history.capacity,
            Arc::clone(&metrics),
        ));
        let router = Arc::new(TopicRouter::new());

        let shards = (0..config.engine.shard_count().max(1))
            .map(|index| {
                Shard::new(
                    index,
                    GarbageCollector::new(config.gc.ttl()),
                    Arc::clone(&broadcaster),
                    Arc::clone(&router),
                )
            })
            .collect();

        Self {
            shards,
            router,
            broadcaster,
            metrics,
            hasher: RandomState::with_seeds(
                SHARD_SEEDS[0],
                SHARD_SEEDS[1],
                SHARD_SEEDS[2],
                SHARD_SEEDS[3],
            ),
            gc_interval: config.gc.interval(),
            closed: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        }
    }

    /// Spawn the flush workers and, if configured, the eviction sweeper.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.check_open()?;
        self.broadcaster.start()?;

        if let Some(interval) = self.gc_interval {
            let mut sweeper = self.sweeper.lock();
            if sweeper.is_none() {
                let (stop, stop_rx) = bounded(0);
                let engine = Arc::downgrade(self);
                let handle = thread::Builder::new()
                    .name("castlite-gc".to_string())
                    .spawn(move || run_sweeper(engine, stop_rx, interval))?;
                *sweeper = Some(Sweeper { stop, handle });
            }
        }

        info!(
            "Engine started: {} shards, gc interval {:?}",
            self.shards.len(),
            self.gc_interval
        );
        Ok(())
    }

    /// Stop background threads. Later calls return [`Error::Closed`].
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let sweeper = self.sweeper.lock().take();
        if let Some(Sweeper { stop, handle }) = sweeper {
            drop(stop);
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("GC sweeper panicked");
            }
        }
        self.broadcaster.shutdown();
        info!("Engine stopped");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    // === Public operations ===

    /// Register a client or reconnect it, replacing its writer.
    pub fn connect(&self, opts: ConnectOptions) -> Result<ChangeLog> {
        self.check_open()?;
        if opts.client.is_empty() {
            return Err(Error::InvalidArgument("client id must not be empty".into()));
        }
        if opts.user.as_deref() == Some("") {
            return Err(Error::InvalidArgument("user id must not be empty".into()));
        }

        let ts = stamp(opts.timestamp);
        let mut log = ChangeLog::new();
        let shard = self.shard(&opts.client);

        if let Some(change) = shard.connect(&opts, ts, &mut log)? {
            if let Some(old) = &change.old {
                self.shard(old).detach_user(old, &opts.client, ts, &mut log);
            }
            if let Some(new) = &change.new {
                let topics = self.shard(new).attach_user(new, &opts.client, ts, &mut log);
                if !topics.is_empty() {
                    shard.subscribe(slice::from_ref(&opts.client), &topics, ts, false, &mut log)?;
                }
            }
        }

        Ok(self.finish(log))
    }

    /// Remove clients, and every client of the given users, for good.
    pub fn disconnect(&self, opts: Options) -> Result<ChangeLog> {
        self.check_open()?;
        let ts = stamp(opts.timestamp);
        let mut log = ChangeLog::new();

        let clients = self.expand_users(opts.clients, &opts.users, &mut log);
        for (index, ids) in self.partition(&clients) {
            let removed = self.shards[index].disconnect(&ids, ts, &mut log)?;
            self.detach_removed(removed, ts, &mut log);
        }

        Ok(self.finish(log))
    }

    /// Drop the writers of clients (and clients of users), keeping their
    /// state for a reconnect until the GC TTL expires.
    pub fn inactivate(&self, opts: Options) -> Result<ChangeLog> {
        self.check_open()?;
        let ts = stamp(opts.timestamp);
        let mut log = ChangeLog::new();

        let clients = self.expand_users(opts.clients, &opts.users, &mut log);
        for (index, ids) in self.partition(&clients) {
            self.shards[index].inactivate(&ids, ts, &mut log)?;
        }

        Ok(self.finish(log))
    }

    /// Subscribe clients and users to topics. User subscriptions propagate
    /// to the user's clients.
    pub fn subscribe(&self, opts: Options) -> Result<ChangeLog> {
        self.check_open()?;
        let ts = stamp(opts.timestamp);
        let mut log = ChangeLog::new();

        for (index, ids) in self.partition(&opts.clients) {
            self.shards[index].subscribe(&ids, &opts.topics, ts, true, &mut log)?;
        }
        for (index, ids) in self.partition(&opts.users) {
            let members = self.shards[index].subscribe_users(&ids, &opts.topics, ts, &mut log);
            for (member_index, member_ids) in self.partition(&members) {
                self.shards[member_index].subscribe(&member_ids, &opts.topics, ts, false, &mut log)?;
            }
        }

        Ok(self.finish(log))
    }

    /// Inverse of [`Engine::subscribe`]. A topic left without members is
    /// destroyed.
    pub fn unsubscribe(&self, opts: Options) -> Result<ChangeLog> {
        self.check_open()?;
        let ts = stamp(opts.timestamp);
        let mut log = ChangeLog::new();

        for (index, ids) in self.partition(&opts.clients) {
            self.shards[index].unsubscribe(&ids, &opts.topics, ts, true, &mut log)?;
        }
        for (index, ids) in self.partition(&opts.users) {
            let members = self.shards[index].unsubscribe_users(&ids, &opts.topics, ts, &mut log);
            for (member_index, member_ids) in self.partition(&members) {
                self.shards[member_index].unsubscribe(&member_ids, &opts.topics, ts, false, &mut log)?;
            }
        }

        Ok(self.finish(log))
    }

    /// Send a payload to clients, users and topics.
    ///
    /// Returns once the message is queued for every target; delivery happens
    /// on the flush workers.
    pub fn publish(&self, opts: Options) -> Result<ChangeLog> {
        self.check_open()?;
        let payload = opts
            .payload
            .ok_or_else(|| Error::InvalidArgument("publish requires a payload".into()))?;
        check_payload_len(payload.len())?;
        let message = Message {
            payload,
            no_buffer: opts.no_buffer,
        };
        let mut log = ChangeLog::new();

        let mut sessions = Vec::with_capacity(opts.clients.len());
        for (index, ids) in self.partition(&opts.clients) {
            sessions.extend(self.shards[index].resolve_clients(&ids, &mut log));
        }

        let mut groups = Vec::with_capacity(opts.users.len() + opts.topics.len());
        for (index, ids) in self.partition(&opts.users) {
            groups.extend(
                self.shards[index]
                    .resolve_users(&ids, &mut log)
                    .into_iter()
                    .map(GroupKey::User),
            );
        }
        for topic in &opts.topics {
            if self.router.contains(topic) {
                groups.push(GroupKey::Topic(Arc::clone(topic)));
            } else {
                log.not_found(EntityKind::Topic, topic);
            }
        }

        self.broadcaster
            .broadcast(&sessions, &groups, slice::from_ref(&message))?;
        self.metrics.add_messages_published(1);

        Ok(self.finish(log))
    }

    /// Evict every client that has been inactive for at least the GC TTL as
    /// of `now`. Runs periodically on the sweeper thread once started.
    pub fn clean(&self, now: Timestamp) -> Result<ChangeLog> {
        self.check_open()?;
        let mut log = ChangeLog::new();
        let mut evicted = 0;

        for shard in self.shards.iter() {
            for (client, since) in shard.expired(now) {
                if let Some(removed) = shard.evict(&client, since, &mut log)? {
                    self.detach_removed(vec![removed], since, &mut log);
                    evicted += 1;
                }
            }
        }

        if evicted > 0 {
            debug!("Evicted {} inactive clients", evicted);
            self.metrics.add_clients_evicted(evicted);
        }
        Ok(self.finish(log))
    }

    // === Lookups ===

    /// Ids of the clients subscribed to `topic`, sorted.
    pub fn presence(&self, topic: &str) -> Vec<Arc<str>> {
        let mut members: Vec<Arc<str>> = self
            .router
            .shards(topic)
            .into_iter()
            .flat_map(|index| self.shards[index].topic_members(topic))
            .collect();
        members.sort();
        members
    }

    /// Number of topics with at least one member.
    pub fn topic_count(&self) -> usize {
        self.router.len()
    }

    /// Latest timestamp at which any shard changed membership of `topic`.
    pub fn topic_updated(&self, topic: &str) -> Option<Timestamp> {
        self.router
            .shards(topic)
            .into_iter()
            .filter_map(|index| self.router.last_seen(topic, index))
            .max()
    }

    pub fn client(&self, id: &str) -> Option<ClientInfo> {
        self.shard(id).client_info(id)
    }

    pub fn user(&self, id: &str) -> Option<UserInfo> {
        self.shard(id).user_info(id)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.broadcaster.queue_depth())
    }

    // === Dispatch helpers ===

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    fn shard_index(&self, id: &str) -> usize {
        (self.hasher.hash_one(id) % self.shards.len() as u64) as usize
    }

    fn shard(&self, id: &str) -> &Shard {
        &self.shards[self.shard_index(id)]
    }

    /// Group ids by owning shard, deduplicated, in ascending shard order.
    fn partition(&self, ids: &[Arc<str>]) -> BTreeMap<usize, Vec<Arc<str>>> {
        let mut parts: BTreeMap<usize, Vec<Arc<str>>> = BTreeMap::new();
        for id in ids {
            parts
                .entry(self.shard_index(id))
                .or_default()
                .push(Arc::clone(id));
        }
        for ids in parts.values_mut() {
            ids.sort_unstable();
            ids.dedup();
        }
        parts
    }

    /// `clients` plus every member client of `users`.
    fn expand_users(
        &self,
        mut clients: Vec<Arc<str>>,
        users: &[Arc<str>],
        log: &mut ChangeLog,
    ) -> Vec<Arc<str>> {
        for (index, ids) in self.partition(users) {
            clients.extend(self.shards[index].user_members(&ids, log));
        }
        clients
    }

    fn detach_removed(&self, removed: Vec<Removed>, ts: Timestamp, log: &mut ChangeLog) {
        for Removed {
            client,
            user,
            updated,
        } in removed
        {
            if let Some(user) = user {
                // An eviction runs at the inactivation time, which can predate
                // a later writer-less connect that attached the user.
                self.shard(&user)
                    .detach_user(&user, &client, ts.max(updated), log);
            }
        }
    }

    fn finish(&self, log: ChangeLog) -> ChangeLog {
        self.metrics.apply(&log);
        log
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn check_payload_len(len: usize) -> Result<()> {
    if len > MAX_PAYLOAD_SIZE {
        return Err(Error::InvalidArgument(format!(
            "payload of {} bytes exceeds the {} byte limit",
            len, MAX_PAYLOAD_SIZE
        )));
    }
    Ok(())
}

fn run_sweeper(engine: Weak<Engine>, stop: Receiver<()>, interval: Duration) {
    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => break,
        }
        let Some(engine) = engine.upgrade() else {
            break;
        };
        if let Err(e) = engine.clean(now()) {
            debug!("GC sweep stopped: {}", e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;

    fn engine(shards: usize) -> Engine {
        let mut config = Config::default();
        config.engine.shards = shards;
        config.gc.interval_ms = 0;
        Engine::new(&config)
    }

    #[test]
    fn test_shard_assignment_is_stable() {
        let a = engine(16);
        let b = engine(16);
        for id in ["alice", "bob", "carol", "dave"] {
            assert_eq!(a.shard_index(id), b.shard_index(id));
            assert!(a.shard_index(id) < 16);
        }
    }

    #[test]
    fn test_partition_groups_and_dedups() {
        let engine = engine(4);
        let ids: Vec<Arc<str>> = ["a", "b", "a", "c"].iter().map(|s| Arc::from(*s)).collect();
        let parts = engine.partition(&ids);
        let total: usize = parts.values().map(Vec::len).sum();
        assert_eq!(total, 3);
        for (index, ids) in &parts {
            assert!(ids.iter().all(|id| engine.shard_index(id) == *index));
        }
    }

    #[test]
    fn test_invalid_arguments() {
        let engine = engine(2);
        assert!(matches!(
            engine.connect(ConnectOptions::new("")),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.connect(ConnectOptions::new("c").user("")),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.publish(Options::new().topic("t")),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        assert!(check_payload_len(0).is_ok());
        assert!(check_payload_len(MAX_PAYLOAD_SIZE).is_ok());
        if let Some(len) = MAX_PAYLOAD_SIZE.checked_add(1) {
            assert!(matches!(
                check_payload_len(len),
                Err(Error::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn test_calls_after_shutdown_are_closed() {
        let engine = engine(2);
        engine.shutdown();
        engine.shutdown();
        assert!(matches!(
            engine.connect(ConnectOptions::new("c")),
            Err(Error::Closed)
        ));
        assert!(matches!(
            engine.subscribe(Options::new().client("c").topic("t")),
            Err(Error::Closed)
        ));
        assert!(matches!(engine.clean(now()), Err(Error::Closed)));
    }

    #[test]
    fn test_user_subscription_propagates_across_shards() {
        let engine = engine(8);
        for client in ["c1", "c2", "c3"] {
            let (transport, _rx) = ChannelTransport::unbounded();
            engine
                .connect(ConnectOptions::new(client).user("u").writer(transport).timestamp(1))
                .unwrap();
        }

        let log = engine
            .subscribe(Options::new().user("u").topic("news").timestamp(2))
            .unwrap();
        assert_eq!(log.topics_created.len(), 1);
        let expected: Vec<Arc<str>> = vec!["c1".into(), "c2".into(), "c3".into()];
        assert_eq!(engine.presence("news"), expected);
        assert_eq!(engine.topic_count(), 1);
        assert!(engine.topic_updated("news").is_some());
        assert_eq!(engine.topic_updated("sports"), None);

        // A client joining later inherits the user's subscriptions.
        engine
            .connect(ConnectOptions::new("c4").user("u").timestamp(3))
            .unwrap();
        assert_eq!(
            engine.client("c4").unwrap().subscriptions,
            vec![Arc::<str>::from("news")]
        );
    }

    #[test]
    fn test_user_switch_on_reconnect() {
        let engine = engine(4);
        engine
            .connect(ConnectOptions::new("c").user("u1").timestamp(1))
            .unwrap();
        let log = engine
            .connect(ConnectOptions::new("c").user("u2").timestamp(2))
            .unwrap();

        assert_eq!(log.users_deleted, vec![Arc::<str>::from("u1")]);
        assert_eq!(log.users_created, vec![Arc::<str>::from("u2")]);
        assert!(engine.user("u1").is_none());
        assert_eq!(
            engine.user("u2").unwrap().clients,
            vec![Arc::<str>::from("c")]
        );
    }

    #[test]
    fn test_disconnect_by_user_removes_members() {
        let engine = engine(4);
        for client in ["c1", "c2"] {
            engine
                .connect(ConnectOptions::new(client).user("u").timestamp(1))
                .unwrap();
        }

        let log = engine
            .disconnect(Options::new().user("u").timestamp(2))
            .unwrap();
        assert_eq!(log.clients_deleted.len(), 2);
        assert_eq!(log.users_deleted, vec![Arc::<str>::from("u")]);
        assert_eq!(engine.metrics().clients, 0);
        assert_eq!(engine.metrics().users, 0);
    }
}
