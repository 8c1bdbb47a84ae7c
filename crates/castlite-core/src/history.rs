//! Fixed-capacity replay history.
//!
//! Each fan-out group owns one `History`: a circular buffer of the last N
//! retained messages. Pushing returns a [`Snapshot`] of the write cursor
//! before the push; loading a snapshot later yields everything written since,
//! provided the buffer has not wrapped past it.
//!
//! The cursor is `(epoch, curlen)`: `curlen` is the next slot to write and
//! `epoch` counts completed wraparounds. A snapshot taken in epoch `e` is
//! still fully readable in epoch `e + 1` as long as the writer has not yet
//! overwritten its offset.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::message::Message;

static NEXT_HISTORY_ID: AtomicU64 = AtomicU64::new(1);

/// Position in a history buffer. Orders by epoch, then offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Snapshot {
    pub epoch: u64,
    pub offset: usize,
}

struct Ring {
    /// Grows lazily up to `capacity`, then is overwritten in place.
    slots: Vec<Message>,
    curlen: usize,
    epoch: u64,
    closed: bool,
}

/// Circular message buffer with epoch-tagged snapshots.
pub struct History {
    id: u64,
    capacity: usize,
    ring: Mutex<Ring>,
}

impl History {
    /// Create a history retaining up to `capacity` messages.
    /// A capacity of 0 retains nothing.
    pub fn new(capacity: usize) -> Self {
        Self {
            id: NEXT_HISTORY_ID.fetch_add(1, Ordering::Relaxed),
            capacity,
            ring: Mutex::new(Ring {
                slots: Vec::new(),
                curlen: 0,
                epoch: 0,
                closed: false,
            }),
        }
    }

    /// Process-unique id, used to tell pointers from different histories apart.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current write cursor.
    pub fn position(&self) -> Snapshot {
        let ring = self.ring.lock();
        Snapshot {
            epoch: ring.epoch,
            offset: ring.curlen,
        }
    }

    /// Number of retained messages.
    pub fn len(&self) -> usize {
        self.ring.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append retainable messages (no-buffer messages are skipped).
    ///
    /// Returns the cursor before the first appended message, or `None` when
    /// nothing was retained.
    pub fn push(&self, messages: &[Message]) -> Option<Snapshot> {
        if self.capacity == 0 {
            return None;
        }

        let mut ring = self.ring.lock();
        if ring.closed {
            return None;
        }

        let mut start = None;
        for msg in messages.iter().filter(|m| !m.no_buffer) {
            if start.is_none() {
                start = Some(Snapshot {
                    epoch: ring.epoch,
                    offset: ring.curlen,
                });
            }

            let pos = ring.curlen;
            if pos < ring.slots.len() {
                ring.slots[pos] = msg.clone();
            } else {
                ring.slots.push(msg.clone());
            }

            ring.curlen += 1;
            if ring.curlen == self.capacity {
                ring.curlen = 0;
                ring.epoch += 1;
            }
        }
        start
    }

    /// Load every message written since `from`.
    ///
    /// Returns the messages and the cursor at which the load ended, or `None`
    /// if `from` has been overwritten (the gap exceeds retention), was issued
    /// in the future, or the history is closed.
    pub fn load(&self, from: Snapshot) -> Option<(Vec<Message>, Snapshot)> {
        let ring = self.ring.lock();
        if ring.closed || from.epoch > ring.epoch {
            return None;
        }

        let end = Snapshot {
            epoch: ring.epoch,
            offset: ring.curlen,
        };

        match ring.epoch - from.epoch {
            0 if from.offset <= ring.curlen => {
                Some((ring.slots[from.offset..ring.curlen].to_vec(), end))
            }
            1 if from.offset >= ring.curlen && from.offset < ring.slots.len() => {
                let mut out = Vec::with_capacity(self.capacity - from.offset + ring.curlen);
                out.extend_from_slice(&ring.slots[from.offset..]);
                out.extend_from_slice(&ring.slots[..ring.curlen]);
                Some((out, end))
            }
            _ => None,
        }
    }

    /// Drop all retained messages. Later pushes and loads are no-ops.
    pub fn close(&self) {
        let mut ring = self.ring.lock();
        ring.closed = true;
        ring.slots = Vec::new();
    }
}

impl std::fmt::Debug for History {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("History")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// A deferred reference into a specific history.
#[derive(Debug, Clone)]
pub struct ReplayPointer {
    pub history: Arc<History>,
    pub snapshot: Snapshot,
}

impl ReplayPointer {
    pub fn new(history: Arc<History>, snapshot: Snapshot) -> Self {
        Self { history, snapshot }
    }

    /// Load everything written since this pointer.
    pub fn load(&self) -> Option<(Vec<Message>, Snapshot)> {
        self.history.load(self.snapshot)
    }

    #[inline]
    pub fn history_id(&self) -> u64 {
        self.history.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msgs(range: std::ops::Range<u32>) -> Vec<Message> {
        range.map(|i| Message::new(i.to_string())).collect()
    }

    fn payloads(messages: &[Message]) -> Vec<String> {
        messages
            .iter()
            .map(|m| String::from_utf8_lossy(&m.payload).into_owned())
            .collect()
    }

    #[test]
    fn test_load_same_epoch() {
        let history = History::new(8);
        history.push(&msgs(0..2));
        let ptr = history.push(&msgs(2..5)).unwrap();

        let (loaded, end) = history.load(ptr).unwrap();
        assert_eq!(payloads(&loaded), vec!["2", "3", "4"]);
        assert_eq!(end, Snapshot { epoch: 0, offset: 5 });
    }

    #[test]
    fn test_load_across_one_wrap() {
        let history = History::new(4);
        history.push(&msgs(0..3));
        let ptr = history.position();
        assert_eq!(ptr, Snapshot { epoch: 0, offset: 3 });

        // 3 more messages: slot 3, then wrap to slots 0 and 1.
        history.push(&msgs(3..6));
        let (loaded, end) = history.load(ptr).unwrap();
        assert_eq!(payloads(&loaded), vec!["3", "4", "5"]);
        assert_eq!(end, Snapshot { epoch: 1, offset: 2 });
    }

    #[test]
    fn test_load_exactly_capacity_messages() {
        let history = History::new(4);
        history.push(&msgs(0..1));
        let ptr = history.position();
        history.push(&msgs(1..5));

        let (loaded, _) = history.load(ptr).unwrap();
        assert_eq!(payloads(&loaded), vec!["1", "2", "3", "4"]);
    }

    #[test]
    fn test_load_expired_after_overwrite() {
        let history = History::new(4);
        history.push(&msgs(0..1));
        let ptr = history.position();

        // capacity + 1 messages since the pointer.
        history.push(&msgs(1..6));
        assert!(history.load(ptr).is_none());
    }

    #[test]
    fn test_load_expired_after_two_wraps() {
        let history = History::new(2);
        let ptr = history.position();
        history.push(&msgs(0..5));
        assert!(history.load(ptr).is_none());
    }

    #[test]
    fn test_no_buffer_messages_are_not_retained() {
        let history = History::new(4);
        assert!(history.push(&[Message::live("x")]).is_none());
        assert!(history.is_empty());

        let ptr = history
            .push(&[Message::live("a"), Message::new("b")])
            .unwrap();
        let (loaded, _) = history.load(ptr).unwrap();
        assert_eq!(payloads(&loaded), vec!["b"]);
    }

    #[test]
    fn test_zero_capacity_retains_nothing() {
        let history = History::new(0);
        assert!(history.push(&msgs(0..3)).is_none());
    }

    #[test]
    fn test_future_pointer_rejected() {
        let history = History::new(4);
        let future = Snapshot { epoch: 3, offset: 0 };
        assert!(history.load(future).is_none());
        let ahead = Snapshot { epoch: 0, offset: 2 };
        assert!(history.load(ahead).is_none());
    }

    #[test]
    fn test_close_drops_messages() {
        let history = History::new(4);
        let ptr = history.push(&msgs(0..2)).unwrap();
        history.close();
        assert!(history.load(ptr).is_none());
        assert!(history.push(&msgs(0..1)).is_none());
    }

    #[test]
    fn test_snapshot_ordering() {
        let a = Snapshot { epoch: 0, offset: 7 };
        let b = Snapshot { epoch: 1, offset: 0 };
        assert!(a < b);
        assert!(Snapshot { epoch: 1, offset: 2 } > b);
    }
}
