//! Per-client delivery unit.
//!
//! A session holds the client's current writer (none while inactive), the
//! messages waiting for the next flush, and the replay pointers collected
//! while the writer was absent. All state sits behind one lock, which is also
//! held while frames are written so a session's output is never interleaved.

use std::mem;
use std::sync::Arc;

use ahash::AHashMap;
use bytes::Bytes;
use log::debug;
use parking_lot::Mutex;

use castlite_core::{GroupKey, Message, ReplayPointer, Snapshot, Timestamp};

use super::{FlushContext, SessionId, WriteSink};
use crate::metrics::EngineMetrics;
use crate::transport::Transport;

/// Result of [`Session::update`].
#[derive(Debug, Default)]
pub struct UpdateOutcome {
    /// False when the update was stale or the session is closed.
    pub applied: bool,
    /// The session went from idle to having data and a writer.
    pub enqueue: bool,
    /// Groups whose missed traffic had already been overwritten in history.
    pub lost: Vec<GroupKey>,
}

#[derive(Default)]
struct SessionState {
    writer: Option<Arc<dyn Transport>>,
    buffer: Vec<Message>,
    /// One pointer per history, in the order they were first recorded.
    pointers: Vec<(GroupKey, ReplayPointer)>,
    /// history id -> cursor up to which the last reconnect replayed.
    replayed: AHashMap<u64, Snapshot>,
    last_update: Timestamp,
    /// When the writer went away. Only memberships older than this are
    /// replayed on reconnect.
    inactive_since: Option<Timestamp>,
    enqueued: bool,
    closed: bool,
}

pub struct Session {
    id: SessionId,
    client: Arc<str>,
    max_buffer: usize,
    metrics: Arc<EngineMetrics>,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(
        id: SessionId,
        client: Arc<str>,
        max_buffer: usize,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            id,
            client,
            max_buffer,
            metrics,
            state: Mutex::new(SessionState::default()),
        }
    }

    #[inline]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[inline]
    pub fn client(&self) -> &Arc<str> {
        &self.client
    }

    pub fn has_writer(&self) -> bool {
        self.state.lock().writer.is_some()
    }

    /// Messages waiting for a flush (or for a writer).
    pub fn buffered(&self) -> usize {
        self.state.lock().buffer.len()
    }

    /// Replay pointers recorded while writer-less.
    pub fn pending_replays(&self) -> usize {
        self.state.lock().pointers.len()
    }

    /// Swap the writer if `ts` is not older than the last update.
    ///
    /// Installing a writer replays every recorded pointer into the buffer.
    /// A replaced writer is closed unless it is the same transport.
    pub fn update(&self, writer: Option<Arc<dyn Transport>>, ts: Timestamp) -> UpdateOutcome {
        let mut st = self.state.lock();
        if st.closed || ts < st.last_update {
            debug!(
                "Ignoring stale session update for {} (ts={}, last={})",
                self.client, ts, st.last_update
            );
            return UpdateOutcome::default();
        }
        st.last_update = ts;

        if let Some(old) = mem::replace(&mut st.writer, writer) {
            let same = st.writer.as_ref().is_some_and(|w| Arc::ptr_eq(w, &old));
            if !same {
                old.close();
            }
        }

        let mut outcome = UpdateOutcome {
            applied: true,
            ..Default::default()
        };
        if st.writer.is_none() {
            st.inactive_since.get_or_insert(ts);
            return outcome;
        }
        st.inactive_since = None;

        for (key, pointer) in mem::take(&mut st.pointers) {
            match pointer.load() {
                Some((messages, end)) => {
                    st.replayed.insert(pointer.history_id(), end);
                    st.buffer.extend(messages);
                    self.metrics.add_replay_served();
                }
                None => {
                    debug!("Replay of {} for {} expired", key, self.client);
                    self.metrics.add_replay_expired();
                    outcome.lost.push(key);
                }
            }
        }

        if !st.buffer.is_empty() && !st.enqueued {
            st.enqueued = true;
            outcome.enqueue = true;
        }
        outcome
    }

    /// Queue messages addressed to this client directly.
    ///
    /// Returns true on the idle -> pending transition only; the caller then
    /// puts the session on the work queue.
    pub fn push(&self, messages: &[Message]) -> bool {
        let mut st = self.state.lock();
        if st.closed {
            return false;
        }
        if st.writer.is_none() {
            let retained = messages.iter().filter(|m| !m.no_buffer).cloned();
            self.buffer_offline(&mut st, retained);
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

    /// Deliver a batch fanned out by `group`.
    ///
    /// With a writer the pre-encoded frames are written, unless the batch was
    /// already covered by a replay or the session has its own data pending
    /// (then the messages queue behind it). Without a writer the history
    /// pointer is recorded, or the raw messages buffered when there is none.
    /// A membership `joined` at or after the inactivation is not replayed.
    pub(crate) fn write(
        &self,
        frames: &[Bytes],
        messages: &[Message],
        group: &GroupKey,
        pointer: Option<&ReplayPointer>,
        joined: Timestamp,
        sink: &mut WriteSink,
    ) {
        let mut st = self.state.lock();
        if st.closed {
            return;
        }

        let Some(writer) = st.writer.clone() else {
            match pointer {
                Some(_) if st.inactive_since.is_some_and(|since| joined >= since) => {
                    self.metrics.add_messages_dropped(messages.len() as u64);
                }
                Some(pointer) => Self::record_pointer(&mut st, group, pointer),
                None => {
                    let retained = messages.iter().filter(|m| !m.no_buffer).cloned();
                    self.buffer_offline(&mut st, retained);
                }
            }
            return;
        };

        if let Some(pointer) = pointer {
            let replayed = st
                .replayed
                .get(&pointer.history_id())
                .is_some_and(|mark| pointer.snapshot < *mark);
            if replayed {
                return;
            }
        }

        if st.enqueued {
            st.buffer.extend_from_slice(messages);
            return;
        }

        sink.write(&*writer, frames, &self.client);
    }

    /// Encode and write everything buffered. Clears `enqueued`.
    pub(crate) fn flush(&self, ctx: &mut FlushContext) {
        let mut st = self.state.lock();
        st.enqueued = false;
        if st.closed || st.buffer.is_empty() {
            return;
        }

        let Some(writer) = st.writer.clone() else {
            // Went inactive while queued: what is left becomes offline backlog.
            let pending = mem::take(&mut st.buffer);
            self.buffer_offline(&mut st, pending.into_iter().filter(|m| !m.no_buffer));
            return;
        };

        let mut batch = mem::take(&mut st.buffer);
        let frames = ctx.encoder.encode(&batch);
        ctx.sink.write(&*writer, frames, &self.client);
        batch.clear();
        st.buffer = batch;
    }

    /// Drop replay state for a group the client left.
    pub(crate) fn forget(&self, group: &GroupKey, history_id: Option<u64>) {
        let mut st = self.state.lock();
        st.pointers.retain(|(key, _)| key != group);
        if let Some(id) = history_id {
            st.replayed.remove(&id);
        }
    }

    /// Release buffers and close the writer. Later calls are no-ops.
    pub fn close(&self) {
        let mut st = self.state.lock();
        if st.closed {
            return;
        }
        st.closed = true;
        st.buffer = Vec::new();
        st.pointers.clear();
        st.replayed.clear();
        if let Some(writer) = st.writer.take() {
            writer.close();
        }
    }

    fn record_pointer(st: &mut SessionState, group: &GroupKey, pointer: &ReplayPointer) {
        let history_id = pointer.history_id();
        if st.pointers.iter().any(|(_, p)| p.history_id() == history_id) {
            return;
        }
        // A batch written after a replay that already covered it resumes from the mark.
        let snapshot = match st.replayed.get(&history_id) {
            Some(mark) if *mark > pointer.snapshot => *mark,
            _ => pointer.snapshot,
        };
        st.pointers.push((
            group.clone(),
            ReplayPointer::new(Arc::clone(&pointer.history), snapshot),
        ));
    }

    fn buffer_offline(&self, st: &mut SessionState, messages: impl IntoIterator<Item = Message>) {
        st.buffer.extend(messages);
        if st.buffer.len() > self.max_buffer {
            let excess = st.buffer.len() - self.max_buffer;
            st.buffer.drain(..excess);
            self.metrics.add_messages_dropped(excess as u64);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("client", &self.client)
            .finish()
    }
}
