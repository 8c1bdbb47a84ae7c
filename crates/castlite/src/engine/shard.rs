//! One partition of the client / user / topic registries.
//!
//! Every operation stamps nothing itself: the dispatch layer passes the call
//! timestamp in. Under the shard lock it applies last-write-wins changes to
//! the registries, records the matching session/group intents on a mutator
//! and commits it before unlocking, so intents from one shard reach the
//! broadcaster in the order the registry changed.

use std::mem;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use log::debug;
use parking_lot::Mutex;

use castlite_core::{ChangeLog, EntityKind, Result, SubscriptionList, Timestamp};

use super::options::ConnectOptions;
use super::router::TopicRouter;
use crate::broadcast::{Broadcaster, Mutator, SessionId};
use crate::gc::GarbageCollector;

/// Connection state of a registered client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Active,
    Inactive { since: Timestamp },
}

/// Read-only view of a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: Arc<str>,
    pub user: Option<Arc<str>>,
    pub status: ClientStatus,
    /// Active subscriptions, sorted.
    pub subscriptions: Vec<Arc<str>>,
    pub updated: Timestamp,
}

/// Read-only view of a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub id: Arc<str>,
    /// Member clients, sorted.
    pub clients: Vec<Arc<str>>,
    /// Active user-level subscriptions, sorted.
    pub subscriptions: Vec<Arc<str>>,
}

/// User membership change produced by a connect.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct UserChange {
    pub old: Option<Arc<str>>,
    pub new: Option<Arc<str>>,
}

/// A client removed from the registry.
#[derive(Debug)]
pub(crate) struct Removed {
    pub client: Arc<str>,
    pub user: Option<Arc<str>>,
    /// Last accepted update, at or after the user attach.
    pub updated: Timestamp,
}

struct Client {
    session: SessionId,
    user: Option<Arc<str>>,
    subscriptions: SubscriptionList,
    status: ClientStatus,
    updated: Timestamp,
}

#[derive(Default)]
struct User {
    /// Member client -> attach timestamp.
    clients: AHashMap<Arc<str>, Timestamp>,
    subscriptions: SubscriptionList,
}

#[derive(Default)]
struct Topic {
    members: AHashSet<Arc<str>>,
}

#[derive(Default)]
struct ShardState {
    clients: AHashMap<Arc<str>, Client>,
    users: AHashMap<Arc<str>, User>,
    topics: AHashMap<Arc<str>, Topic>,
}

pub(crate) struct Shard {
    index: usize,
    state: Mutex<ShardState>,
    gc: GarbageCollector,
    broadcaster: Arc<Broadcaster>,
    router: Arc<TopicRouter>,
}

impl Shard {
    pub fn new(
        index: usize,
        gc: GarbageCollector,
        broadcaster: Arc<Broadcaster>,
        router: Arc<TopicRouter>,
    ) -> Self {
        Self {
            index,
            state: Mutex::new(ShardState::default()),
            gc,
            broadcaster,
            router,
        }
    }

    // === Clients ===

    /// Register a client, or reconnect / update an existing one.
    ///
    /// Returns the user membership change the dispatch layer must apply on
    /// the user's shard, or `None` if there is nothing to do there.
    pub fn connect(
        &self,
        opts: &ConnectOptions,
        ts: Timestamp,
        log: &mut ChangeLog,
    ) -> Result<Option<UserChange>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut m = self.broadcaster.mutator(ts);
        let id = &opts.client;

        let change = match state.clients.get_mut(id) {
            None => {
                let session = self.broadcaster.next_session_id();
                let status = match opts.writer {
                    Some(_) => ClientStatus::Active,
                    None => ClientStatus::Inactive { since: ts },
                };
                state.clients.insert(
                    Arc::clone(id),
                    Client {
                        session,
                        user: opts.user.clone(),
                        subscriptions: SubscriptionList::new(),
                        status,
                        updated: ts,
                    },
                );
                m.update_client(session, Arc::clone(id), opts.writer.clone());
                if let Some(user) = &opts.user {
                    m.attach_user(session, Arc::clone(user));
                }
                log.clients_created.push(Arc::clone(id));
                if let ClientStatus::Inactive { .. } = status {
                    self.gc.add(id, ts);
                    log.clients_inactivated.push(Arc::clone(id));
                }
                opts.user.as_ref().map(|user| UserChange {
                    old: None,
                    new: Some(Arc::clone(user)),
                })
            }
            Some(client) if ts < client.updated => {
                debug!(
                    "Ignoring stale connect for {} (ts={}, last={})",
                    id, ts, client.updated
                );
                None
            }
            Some(client) => {
                client.updated = ts;
                m.update_client(client.session, Arc::clone(id), opts.writer.clone());

                match (client.status, opts.writer.is_some()) {
                    (ClientStatus::Inactive { .. }, true) => {
                        client.status = ClientStatus::Active;
                        self.gc.delete(id, ts);
                        log.clients_reactivated.push(Arc::clone(id));
                    }
                    (ClientStatus::Active, false) => {
                        client.status = ClientStatus::Inactive { since: ts };
                        self.gc.add(id, ts);
                        log.clients_inactivated.push(Arc::clone(id));
                    }
                    _ => {}
                }

                if client.user != opts.user {
                    if let Some(old) = &client.user {
                        m.detach_user(client.session, Arc::clone(old));
                    }
                    if let Some(new) = &opts.user {
                        m.attach_user(client.session, Arc::clone(new));
                    }
                    let old = mem::replace(&mut client.user, opts.user.clone());
                    Some(UserChange {
                        old,
                        new: opts.user.clone(),
                    })
                } else {
                    None
                }
            }
        };

        let report = m.commit()?;
        log.unrecoverable.extend(report.unrecoverable);
        Ok(change)
    }

    /// Remove clients for good. Returns the removed clients and their users.
    pub fn disconnect(
        &self,
        ids: &[Arc<str>],
        ts: Timestamp,
        log: &mut ChangeLog,
    ) -> Result<Vec<Removed>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut m = self.broadcaster.mutator(ts);
        let mut removed = Vec::new();

        for id in ids {
            let stale = match state.clients.get(id) {
                None => {
                    log.not_found(EntityKind::Client, id);
                    continue;
                }
                Some(client) => ts < client.updated,
            };
            if stale {
                debug!("Ignoring stale disconnect for {} (ts={})", id, ts);
                continue;
            }
            if let Some(client) = state.clients.remove(id) {
                removed.push(self.remove_client(state, id, client, &mut m, log));
            }
        }

        m.commit()?;
        Ok(removed)
    }

    /// Remove a client the collector found expired, unless it reconnected
    /// or went inactive again since.
    pub fn evict(
        &self,
        id: &Arc<str>,
        since: Timestamp,
        log: &mut ChangeLog,
    ) -> Result<Option<Removed>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let expired = state
            .clients
            .get(id)
            .is_some_and(|c| c.status == ClientStatus::Inactive { since });
        if !expired {
            return Ok(None);
        }

        let mut m = self.broadcaster.mutator(since);
        let removed = state
            .clients
            .remove(id)
            .map(|client| self.remove_client(state, id, client, &mut m, log));
        m.commit()?;
        Ok(removed)
    }

    /// Drop the writer of each client and start its eviction clock.
    pub fn inactivate(&self, ids: &[Arc<str>], ts: Timestamp, log: &mut ChangeLog) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut m = self.broadcaster.mutator(ts);

        for id in ids {
            let Some(client) = state.clients.get_mut(id) else {
                log.not_found(EntityKind::Client, id);
                continue;
            };
            if ts < client.updated {
                debug!("Ignoring stale inactivate for {} (ts={})", id, ts);
                continue;
            }
            client.updated = ts;
            if client.status == ClientStatus::Active {
                client.status = ClientStatus::Inactive { since: ts };
                m.update_client(client.session, Arc::clone(id), None);
                self.gc.add(id, ts);
                log.clients_inactivated.push(Arc::clone(id));
            }
        }

        m.commit()?;
        Ok(())
    }

    /// Subscribe clients to topics at `ts`.
    ///
    /// Missing clients are reported only when `report_missing` is set; user
    /// propagation passes false since members may have left meanwhile.
    pub fn subscribe(
        &self,
        ids: &[Arc<str>],
        topics: &[Arc<str>],
        ts: Timestamp,
        report_missing: bool,
        log: &mut ChangeLog,
    ) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut m = self.broadcaster.mutator(ts);

        for id in ids {
            let Some(client) = state.clients.get_mut(id) else {
                if report_missing {
                    log.not_found(EntityKind::Client, id);
                }
                continue;
            };
            for topic in topics {
                if client.subscriptions.add(topic, ts) {
                    self.join_topic(&mut state.topics, topic, id, ts, log);
                    m.subscribe(client.session, Arc::clone(topic));
                }
            }
        }

        m.commit()?;
        Ok(())
    }

    /// Unsubscribe clients from topics at `ts`, leaving tombstones.
    pub fn unsubscribe(
        &self,
        ids: &[Arc<str>],
        topics: &[Arc<str>],
        ts: Timestamp,
        report_missing: bool,
        log: &mut ChangeLog,
    ) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut m = self.broadcaster.mutator(ts);

        for id in ids {
            let Some(client) = state.clients.get_mut(id) else {
                if report_missing {
                    log.not_found(EntityKind::Client, id);
                }
                continue;
            };
            for topic in topics {
                let was_active = client.subscriptions.is_active(topic);
                if client.subscriptions.delete(topic, ts) && was_active {
                    self.leave_topic(&mut state.topics, topic, id, log);
                    m.unsubscribe(client.session, Arc::clone(topic));
                }
            }
        }

        m.commit()?;
        Ok(())
    }

    /// Session handles of the given clients.
    pub fn resolve_clients(&self, ids: &[Arc<str>], log: &mut ChangeLog) -> Vec<SessionId> {
        let state = self.state.lock();
        ids.iter()
            .filter_map(|id| match state.clients.get(id) {
                Some(client) => Some(client.session),
                None => {
                    log.not_found(EntityKind::Client, id);
                    None
                }
            })
            .collect()
    }

    // === Users ===

    /// Add `client` to `user`, creating the user on first use.
    /// Returns the user's active subscriptions for propagation.
    pub fn attach_user(
        &self,
        user: &Arc<str>,
        client: &Arc<str>,
        ts: Timestamp,
        log: &mut ChangeLog,
    ) -> Vec<Arc<str>> {
        let mut state = self.state.lock();
        let entry = state.users.entry(Arc::clone(user)).or_insert_with(|| {
            log.users_created.push(Arc::clone(user));
            User::default()
        });

        match entry.clients.get_mut(client) {
            Some(attached) => *attached = (*attached).max(ts),
            None => {
                entry.clients.insert(Arc::clone(client), ts);
            }
        }
        entry.subscriptions.active().map(|s| s.topic).collect()
    }

    /// Remove `client` from `user`; the user goes away with its last client.
    pub fn detach_user(
        &self,
        user: &Arc<str>,
        client: &Arc<str>,
        ts: Timestamp,
        log: &mut ChangeLog,
    ) {
        let mut state = self.state.lock();
        let Some(entry) = state.users.get_mut(user) else {
            return;
        };
        if entry.clients.get(client).is_some_and(|&attached| attached <= ts) {
            entry.clients.remove(client);
        }
        if entry.clients.is_empty() {
            state.users.remove(user);
            log.users_deleted.push(Arc::clone(user));
        }
    }

    /// Apply user-level subscriptions. Returns the member clients of every
    /// user whose list changed, for propagation.
    pub fn subscribe_users(
        &self,
        ids: &[Arc<str>],
        topics: &[Arc<str>],
        ts: Timestamp,
        log: &mut ChangeLog,
    ) -> Vec<Arc<str>> {
        self.update_users(ids, log, |subs| {
            topics.iter().fold(false, |changed, t| subs.add(t, ts) | changed)
        })
    }

    /// Remove user-level subscriptions. Returns members for propagation.
    pub fn unsubscribe_users(
        &self,
        ids: &[Arc<str>],
        topics: &[Arc<str>],
        ts: Timestamp,
        log: &mut ChangeLog,
    ) -> Vec<Arc<str>> {
        self.update_users(ids, log, |subs| {
            topics
                .iter()
                .fold(false, |changed, t| subs.delete(t, ts) | changed)
        })
    }

    fn update_users<F>(&self, ids: &[Arc<str>], log: &mut ChangeLog, mut apply: F) -> Vec<Arc<str>>
    where
        F: FnMut(&mut SubscriptionList) -> bool,
    {
        let mut state = self.state.lock();
        let mut members = Vec::new();
        for id in ids {
            let Some(user) = state.users.get_mut(id) else {
                log.not_found(EntityKind::User, id);
                continue;
            };
            if apply(&mut user.subscriptions) {
                members.extend(user.clients.keys().cloned());
            }
        }
        members
    }

    /// The given users that exist; the rest are reported not found.
    pub fn resolve_users(&self, ids: &[Arc<str>], log: &mut ChangeLog) -> Vec<Arc<str>> {
        let state = self.state.lock();
        ids.iter()
            .filter(|id| {
                let found = state.users.contains_key(*id);
                if !found {
                    log.not_found(EntityKind::User, id);
                }
                found
            })
            .cloned()
            .collect()
    }

    /// Member clients of the given users.
    pub fn user_members(&self, ids: &[Arc<str>], log: &mut ChangeLog) -> Vec<Arc<str>> {
        let state = self.state.lock();
        let mut members = Vec::new();
        for id in ids {
            match state.users.get(id) {
                Some(user) => members.extend(user.clients.keys().cloned()),
                None => log.not_found(EntityKind::User, id),
            }
        }
        members
    }

    // === Topics and lookups ===

    /// Clients on this shard subscribed to `topic`.
    pub fn topic_members(&self, topic: &str) -> Vec<Arc<str>> {
        self.state
            .lock()
            .topics
            .get(topic)
            .map(|t| t.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn client_info(&self, id: &str) -> Option<ClientInfo> {
        let state = self.state.lock();
        let (id, client) = state.clients.get_key_value(id)?;
        let mut subscriptions: Vec<_> = client.subscriptions.active().map(|s| s.topic).collect();
        subscriptions.sort();
        Some(ClientInfo {
            id: Arc::clone(id),
            user: client.user.clone(),
            status: client.status,
            subscriptions,
            updated: client.updated,
        })
    }

    pub fn user_info(&self, id: &str) -> Option<UserInfo> {
        let state = self.state.lock();
        let (id, user) = state.users.get_key_value(id)?;
        let mut clients: Vec<_> = user.clients.keys().cloned().collect();
        clients.sort();
        let mut subscriptions: Vec<_> = user.subscriptions.active().map(|s| s.topic).collect();
        subscriptions.sort();
        Some(UserInfo {
            id: Arc::clone(id),
            clients,
            subscriptions,
        })
    }

    #[cfg(test)]
    pub fn client_count(&self) -> usize {
        self.state.lock().clients.len()
    }

    /// Inactive clients whose TTL elapsed as of `now`, with their inactivation time.
    pub fn expired(&self, now: Timestamp) -> Vec<(Arc<str>, Timestamp)> {
        let mut expired = Vec::new();
        self.gc
            .collect(now, |client, since| expired.push((Arc::clone(client), since)));
        expired
    }

    // === Helpers (shard lock held) ===

    fn remove_client(
        &self,
        state: &mut ShardState,
        id: &Arc<str>,
        client: Client,
        m: &mut Mutator<'_>,
        log: &mut ChangeLog,
    ) -> Removed {
        for sub in client.subscriptions.active() {
            self.leave_topic(&mut state.topics, &sub.topic, id, log);
        }
        m.delete_client(client.session);
        self.gc.remove(id);
        log.clients_deleted.push(Arc::clone(id));
        Removed {
            client: Arc::clone(id),
            user: client.user,
            updated: client.updated,
        }
    }

    fn join_topic(
        &self,
        topics: &mut AHashMap<Arc<str>, Topic>,
        topic: &Arc<str>,
        client: &Arc<str>,
        ts: Timestamp,
        log: &mut ChangeLog,
    ) {
        topics
            .entry(Arc::clone(topic))
            .or_default()
            .members
            .insert(Arc::clone(client));
        if self.router.touch(topic, self.index, ts) {
            log.topics_created.push(Arc::clone(topic));
        }
    }

    fn leave_topic(
        &self,
        topics: &mut AHashMap<Arc<str>, Topic>,
        topic: &Arc<str>,
        client: &Arc<str>,
        log: &mut ChangeLog,
    ) {
        let Some(entry) = topics.get_mut(topic) else {
            return;
        };
        entry.members.remove(client);
        if entry.members.is_empty() {
            topics.remove(topic);
            if self.router.remove(topic, self.index) {
                log.topics_deleted.push(Arc::clone(topic));
            }
        }
    }
}
