//! Batched membership intents.
//!
//! Engine shards describe what should happen to sessions and groups as a
//! list of [`Mutation`]s and commit them in one go. Commit applies them in a
//! fixed phase order, so for example a client deleted in the same batch it
//! subscribed in ends up removed rather than half-registered.

use std::mem;
use std::sync::Arc;

use castlite_core::{GroupKey, Result, Timestamp};

use super::{Broadcaster, SessionId};
use crate::transport::Transport;

/// One recorded intent.
pub enum Mutation {
    DeleteClient {
        session: SessionId,
    },
    /// Creates the session on first use, then swaps its writer.
    UpdateClient {
        session: SessionId,
        client: Arc<str>,
        writer: Option<Arc<dyn Transport>>,
    },
    AttachUser {
        session: SessionId,
        user: Arc<str>,
    },
    DetachUser {
        session: SessionId,
        user: Arc<str>,
    },
    Subscribe {
        session: SessionId,
        topic: Arc<str>,
    },
    Unsubscribe {
        session: SessionId,
        topic: Arc<str>,
    },
}

impl Mutation {
    /// Commit order: deletions, writer updates, attach, detach, subscribe, unsubscribe.
    fn phase(&self) -> u8 {
        match self {
            Mutation::DeleteClient { .. } => 0,
            Mutation::UpdateClient { .. } => 1,
            Mutation::AttachUser { .. } => 2,
            Mutation::DetachUser { .. } => 3,
            Mutation::Subscribe { .. } => 4,
            Mutation::Unsubscribe { .. } => 5,
        }
    }

    fn session(&self) -> SessionId {
        match self {
            Mutation::DeleteClient { session }
            | Mutation::UpdateClient { session, .. }
            | Mutation::AttachUser { session, .. }
            | Mutation::DetachUser { session, .. }
            | Mutation::Subscribe { session, .. }
            | Mutation::Unsubscribe { session, .. } => *session,
        }
    }
}

/// What a commit observed that the caller has to report.
#[derive(Debug, Default)]
pub struct CommitReport {
    /// Groups whose missed traffic could not be replayed to a reconnecting client.
    pub unrecoverable: Vec<GroupKey>,
}

/// Scoped recorder of intents. Commits on [`Mutator::commit`] or on drop.
pub struct Mutator<'a> {
    broadcaster: &'a Broadcaster,
    ts: Timestamp,
    ops: Vec<Mutation>,
}

impl<'a> Mutator<'a> {
    pub(super) fn new(broadcaster: &'a Broadcaster, ts: Timestamp, ops: Vec<Mutation>) -> Self {
        Self {
            broadcaster,
            ts,
            ops,
        }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn delete_client(&mut self, session: SessionId) {
        self.ops.push(Mutation::DeleteClient { session });
    }

    pub fn update_client(
        &mut self,
        session: SessionId,
        client: Arc<str>,
        writer: Option<Arc<dyn Transport>>,
    ) {
        self.ops.push(Mutation::UpdateClient {
            session,
            client,
            writer,
        });
    }

    pub fn attach_user(&mut self, session: SessionId, user: Arc<str>) {
        self.ops.push(Mutation::AttachUser { session, user });
    }

    pub fn detach_user(&mut self, session: SessionId, user: Arc<str>) {
        self.ops.push(Mutation::DetachUser { session, user });
    }

    pub fn subscribe(&mut self, session: SessionId, topic: Arc<str>) {
        self.ops.push(Mutation::Subscribe { session, topic });
    }

    pub fn unsubscribe(&mut self, session: SessionId, topic: Arc<str>) {
        self.ops.push(Mutation::Unsubscribe { session, topic });
    }

    /// Apply every recorded intent.
    ///
    /// All intents are applied even if enqueueing fails; the first error is
    /// returned afterwards.
    pub fn commit(mut self) -> Result<CommitReport> {
        self.apply()
    }

    fn apply(&mut self) -> Result<CommitReport> {
        let broadcaster = self.broadcaster;
        let ts = self.ts;
        let mut report = CommitReport::default();
        let mut first_err = None;
        let mut deleted: Vec<SessionId> = Vec::new();

        self.ops.sort_by_key(Mutation::phase);
        for op in self.ops.drain(..) {
            if !matches!(op, Mutation::DeleteClient { .. }) && deleted.contains(&op.session()) {
                continue;
            }
            match op {
                Mutation::DeleteClient { session } => {
                    broadcaster.delete_session(session);
                    deleted.push(session);
                }
                Mutation::UpdateClient {
                    session,
                    client,
                    writer,
                } => {
                    if let Err(e) =
                        broadcaster.update_session(session, &client, writer, ts, &mut report)
                    {
                        first_err.get_or_insert(e);
                    }
                }
                Mutation::AttachUser { session, user } => {
                    broadcaster.join(session, GroupKey::User(user), ts);
                }
                Mutation::DetachUser { session, user } => {
                    broadcaster.leave(session, &GroupKey::User(user), ts);
                }
                Mutation::Subscribe { session, topic } => {
                    broadcaster.join(session, GroupKey::Topic(topic), ts);
                }
                Mutation::Unsubscribe { session, topic } => {
                    broadcaster.leave(session, &GroupKey::Topic(topic), ts);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

impl Drop for Mutator<'_> {
    fn drop(&mut self) {
        if !self.ops.is_empty() {
            let _ = self.apply();
        }
        self.broadcaster.recycle(mem::take(&mut self.ops));
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::config::BroadcastConfig;
    use crate::metrics::EngineMetrics;
    use crate::transport::ChannelTransport;
    use castlite_core::Message;

    fn broadcaster() -> Broadcaster {
        Broadcaster::new(
            &BroadcastConfig::default(),
            8,
            Arc::new(EngineMetrics::new()),
        )
    }

    fn transport() -> (Arc<dyn Transport>, crossbeam_channel::Receiver<Bytes>) {
        let (t, rx) = ChannelTransport::unbounded();
        (t as Arc<dyn Transport>, rx)
    }

    #[test]
    fn test_commit_order_delete_wins_over_subscribe() {
        let b = broadcaster();
        let id = b.next_session_id();
        let (w, _rx) = transport();

        let mut m = b.mutator(1);
        m.update_client(id, Arc::from("c1"), Some(w));
        m.commit().unwrap();

        // Recorded subscribe-first; delete still applies first and wins.
        let mut m = b.mutator(2);
        m.subscribe(id, Arc::from("t"));
        m.delete_client(id);
        m.update_client(id, Arc::from("c1"), None);
        m.commit().unwrap();

        assert!(b.session(id).is_none());
        assert!(b.group(&GroupKey::topic("t")).is_none());
    }

    #[test]
    fn test_subscribe_then_unsubscribe_in_one_batch() {
        let b = broadcaster();
        let id = b.next_session_id();
        let (w, _rx) = transport();

        let mut m = b.mutator(1);
        m.update_client(id, Arc::from("c1"), Some(w));
        m.subscribe(id, Arc::from("t"));
        m.commit().unwrap();
        assert!(b.group(&GroupKey::topic("t")).is_some());

        // Same timestamp as the join: the leave is stale and ignored.
        let mut m = b.mutator(1);
        m.unsubscribe(id, Arc::from("t"));
        m.commit().unwrap();
        assert_eq!(b.group(&GroupKey::topic("t")).unwrap().active_members(), 1);
    }

    #[test]
    fn test_drop_commits_and_recycles() {
        let b = broadcaster();
        let id = b.next_session_id();
        {
            let mut m = b.mutator(1);
            m.update_client(id, Arc::from("c1"), None);
            assert_eq!(m.len(), 1);
        }
        assert!(b.session(id).is_some());
        assert_eq!(b.pool.len(), 1);

        let m = b.mutator(2);
        assert!(m.is_empty());
        assert_eq!(b.pool.len(), 0);
    }

    #[test]
    fn test_reconnect_reports_unrecoverable_group() {
        let b = broadcaster();
        let id = b.next_session_id();
        let (w, _rx) = transport();

        let mut m = b.mutator(1);
        m.update_client(id, Arc::from("c1"), Some(w));
        m.subscribe(id, Arc::from("t"));
        m.commit().unwrap();

        let mut m = b.mutator(2);
        m.update_client(id, Arc::from("c1"), None);
        m.commit().unwrap();

        // History holds 8; 9 single-message batches overrun the first pointer.
        for i in 0..9 {
            b.broadcast(&[], &[GroupKey::topic("t")], &[Message::new(i.to_string())])
                .unwrap();
            b.run_pending();
        }

        let (w, _rx) = transport();
        let mut m = b.mutator(3);
        m.update_client(id, Arc::from("c1"), Some(w));
        let report = m.commit().unwrap();
        assert_eq!(report.unrecoverable, vec![GroupKey::topic("t")]);
    }
}
