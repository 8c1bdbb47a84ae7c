//! Per-topic / per-user fan-out unit.
//!
//! A group buffers messages published to it and, on flush, records them in
//! its history, encodes them once and hands the same frames to every active
//! member session.

use std::mem;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;

use castlite_core::{GroupKey, History, Message, ReplayPointer, Timestamp};

use super::session::Session;
use super::{FlushContext, SessionId};

/// Membership record. `session` is `None` for a tombstone.
struct Member {
    session: Option<Arc<Session>>,
    ts: Timestamp,
}

#[derive(Default)]
struct GroupState {
    members: AHashMap<SessionId, Member>,
    active: usize,
    buffer: Vec<Message>,
    enqueued: bool,
    closed: bool,
}

pub struct Group {
    key: GroupKey,
    history: Option<Arc<History>>,
    state: Mutex<GroupState>,
}

impl Group {
    /// Create a group retaining up to `history_capacity` messages for replay.
    pub fn new(key: GroupKey, history_capacity: usize) -> Self {
        let history = (history_capacity > 0).then(|| Arc::new(History::new(history_capacity)));
        Self {
            key,
            history,
            state: Mutex::new(GroupState::default()),
        }
    }

    #[inline]
    pub fn key(&self) -> &GroupKey {
        &self.key
    }

    pub fn history_id(&self) -> Option<u64> {
        self.history.as_ref().map(|h| h.id())
    }

    pub fn active_members(&self) -> usize {
        self.state.lock().active
    }

    /// Membership records, tombstones included.
    pub fn len(&self) -> usize {
        self.state.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add `session` as a member at `ts`. No-op if a record at least as new exists.
    pub fn add(&self, session: &Arc<Session>, ts: Timestamp) -> bool {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.closed {
            return false;
        }
        match st.members.get_mut(&session.id()) {
            Some(member) if member.ts >= ts => false,
            Some(member) => {
                let was_active = member.session.is_some();
                member.session = Some(Arc::clone(session));
                member.ts = ts;
                if !was_active {
                    st.active += 1;
                }
                true
            }
            None => {
                st.members.insert(
                    session.id(),
                    Member {
                        session: Some(Arc::clone(session)),
                        ts,
                    },
                );
                st.active += 1;
                true
            }
        }
    }

    /// Remove a member at `ts`, leaving a tombstone.
    ///
    /// `forced` purges the record instead and ignores ordering; it is used
    /// when the client is deleted for good. Returns true if an active
    /// membership ended.
    pub fn delete(&self, id: SessionId, ts: Timestamp, forced: bool) -> bool {
        let mut st = self.state.lock();
        let ended = if forced {
            st.members
                .remove(&id)
                .is_some_and(|member| member.session.is_some())
        } else {
            match st.members.get_mut(&id) {
                Some(member) if member.ts >= ts => false,
                Some(member) => {
                    member.ts = ts;
                    member.session.take().is_some()
                }
                None => {
                    st.members.insert(id, Member { session: None, ts });
                    false
                }
            }
        };
        if ended {
            st.active -= 1;
        }
        ended
    }

    /// Queue messages for fan-out. Returns true on the idle -> pending transition.
    pub fn push(&self, messages: &[Message]) -> bool {
        let mut st = self.state.lock();
        if st.closed || st.active == 0 {
            return false;
        }
        st.buffer.extend_from_slice(messages);
        if st.enqueued {
            false
        } else {
            st.enqueued = true;
            true
        }
    }

    /// Drain the buffer: record in history, encode once, write to every member.
    ///
    /// Loops until the buffer is empty so a group is only ever flushed by the
    /// worker that dequeued it.
    pub(crate) fn flush(&self, ctx: &mut FlushContext) {
        loop {
            let mut members = mem::take(&mut ctx.members);
            let batch = {
                let mut st = self.state.lock();
                if st.closed || st.buffer.is_empty() {
                    st.enqueued = false;
                    ctx.members = members;
                    return;
                }
                members.extend(
                    st.members
                        .values()
                        .filter_map(|m| m.session.clone().map(|s| (s, m.ts))),
                );
                mem::take(&mut st.buffer)
            };

            let pointer = self.history.as_ref().and_then(|history| {
                history
                    .push(&batch)
                    .map(|snapshot| ReplayPointer::new(Arc::clone(history), snapshot))
            });
            let frames = ctx.encoder.encode(&batch);
            for (session, joined) in &members {
                session.write(
                    frames,
                    &batch,
                    &self.key,
                    pointer.as_ref(),
                    *joined,
                    &mut ctx.sink,
                );
            }

            members.clear();
            ctx.members = members;
        }
    }

    /// Drop members, buffered messages and history.
    pub fn close(&self) {
        let mut st = self.state.lock();
        st.closed = true;
        st.members.clear();
        st.active = 0;
        st.buffer = Vec::new();
        if let Some(history) = &self.history {
            history.close();
        }
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("key", &self.key)
            .field("history", &self.history)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::metrics::EngineMetrics;
    use crate::transport::{drain_payloads, ChannelTransport, Transport};

    fn online(id: u64) -> (Arc<Session>, crossbeam_channel::Receiver<Bytes>) {
        let session = Arc::new(Session::new(
            SessionId(id),
            Arc::from(format!("c{}", id)),
            16,
            Arc::new(EngineMetrics::new()),
        ));
        let (transport, rx) = ChannelTransport::unbounded();
        session.update(Some(transport as Arc<dyn Transport>), 1);
        (session, rx)
    }

    fn ctx() -> FlushContext {
        FlushContext::new(1024, Arc::new(EngineMetrics::new()))
    }

    #[test]
    fn test_membership_is_last_write_wins() {
        let group = Group::new(GroupKey::topic("t"), 0);
        let (s, _rx) = online(1);

        assert!(group.add(&s, 10));
        assert!(!group.add(&s, 10));
        assert!(!group.delete(s.id(), 5, false), "older leave is ignored");
        assert_eq!(group.active_members(), 1);

        assert!(group.delete(s.id(), 20, false));
        assert_eq!(group.active_members(), 0);
        assert_eq!(group.len(), 1, "tombstone kept");
        assert!(!group.add(&s, 15), "tombstone blocks older join");
        assert!(group.add(&s, 21));
    }

    #[test]
    fn test_leave_before_join_leaves_tombstone() {
        let group = Group::new(GroupKey::topic("t"), 0);
        let (s, _rx) = online(1);

        assert!(!group.delete(s.id(), 30, false));
        assert!(!group.add(&s, 25));
        assert_eq!(group.active_members(), 0);
    }

    #[test]
    fn test_forced_delete_purges_record() {
        let group = Group::new(GroupKey::topic("t"), 0);
        let (s, _rx) = online(1);

        group.add(&s, 10);
        assert!(group.delete(s.id(), 0, true));
        assert!(group.is_empty());
        assert!(group.add(&s, 1), "no tombstone left behind");
    }

    #[test]
    fn test_push_without_active_members_is_dropped() {
        let group = Group::new(GroupKey::topic("t"), 4);
        assert!(!group.push(&[Message::new("x")]));
    }

    #[test]
    fn test_flush_fans_out_to_every_member() {
        let group = Group::new(GroupKey::topic("t"), 4);
        let members: Vec<_> = (1..=3).map(online).collect();
        for (s, _) in &members {
            group.add(s, 1);
        }

        assert!(group.push(&[Message::new("a")]));
        assert!(!group.push(&[Message::new("b")]));
        group.flush(&mut ctx());

        for (_, rx) in &members {
            let got = drain_payloads(rx).unwrap();
            assert_eq!(got, vec![Bytes::from("a"), Bytes::from("b")]);
        }
        assert!(group.push(&[Message::new("c")]), "flush resets enqueued");
    }

    #[test]
    fn test_flush_records_pointer_for_offline_member() {
        let group = Group::new(GroupKey::topic("t"), 4);
        let (s, _rx) = online(1);
        group.add(&s, 1);
        s.update(None, 2);

        group.push(&[Message::new("a")]);
        group.flush(&mut ctx());
        assert_eq!(s.pending_replays(), 1);
    }

    #[test]
    fn test_closed_group_rejects_everything() {
        let group = Group::new(GroupKey::user("u"), 4);
        let (s, _rx) = online(1);
        group.add(&s, 1);
        group.close();
        assert!(!group.push(&[Message::new("a")]));
        assert!(!group.add(&s, 2));
        assert_eq!(group.active_members(), 0);
    }
}
