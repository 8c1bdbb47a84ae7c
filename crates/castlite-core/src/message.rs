//! Messages and fan-out group keys.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

/// A message routed through the engine.
///
/// The payload is reference-counted so a single publish fanned out to
/// thousands of sessions shares one allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Opaque payload bytes.
    pub payload: Bytes,
    /// Live-only delivery: never retained in History or offline buffers.
    pub no_buffer: bool,
}

impl Message {
    /// Create a message that is eligible for replay.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            no_buffer: false,
        }
    }

    /// Create a live-only message.
    pub fn live(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            no_buffer: true,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Identifies a fan-out group inside the broadcaster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupKey {
    /// All sessions subscribed to a topic.
    Topic(Arc<str>),
    /// All sessions of a user's connected clients.
    User(Arc<str>),
}

impl GroupKey {
    pub fn topic(id: impl Into<Arc<str>>) -> Self {
        GroupKey::Topic(id.into())
    }

    pub fn user(id: impl Into<Arc<str>>) -> Self {
        GroupKey::User(id.into())
    }

    /// The topic or user id.
    pub fn id(&self) -> &Arc<str> {
        match self {
            GroupKey::Topic(id) | GroupKey::User(id) => id,
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::Topic(id) => write!(f, "topic:{}", id),
            GroupKey::User(id) => write!(f, "user:{}", id),
        }
    }
}
