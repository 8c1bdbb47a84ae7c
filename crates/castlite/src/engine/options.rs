//! Call options for the public engine API.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use castlite_core::Timestamp;

use crate::transport::Transport;

/// Targets and parameters of a disconnect, inactivate, subscribe,
/// unsubscribe or publish call. A zero timestamp means "now".
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub clients: Vec<Arc<str>>,
    pub users: Vec<Arc<str>>,
    pub topics: Vec<Arc<str>>,
    pub timestamp: Timestamp,
    /// Publish only.
    pub payload: Option<Bytes>,
    /// Publish only: deliver live, never buffer or replay.
    pub no_buffer: bool,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(mut self, id: impl Into<Arc<str>>) -> Self {
        self.clients.push(id.into());
        self
    }

    pub fn clients<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Arc<str>>,
    {
        self.clients.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn user(mut self, id: impl Into<Arc<str>>) -> Self {
        self.users.push(id.into());
        self
    }

    pub fn users<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Arc<str>>,
    {
        self.users.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn topic(mut self, id: impl Into<Arc<str>>) -> Self {
        self.topics.push(id.into());
        self
    }

    pub fn topics<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Arc<str>>,
    {
        self.topics.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn timestamp(mut self, ts: Timestamp) -> Self {
        self.timestamp = ts;
        self
    }

    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn no_buffer(mut self, no_buffer: bool) -> Self {
        self.no_buffer = no_buffer;
        self
    }
}

/// Parameters of a connect call.
#[derive(Clone)]
pub struct ConnectOptions {
    pub client: Arc<str>,
    pub user: Option<Arc<str>>,
    /// `None` registers the client as inactive.
    pub writer: Option<Arc<dyn Transport>>,
    pub timestamp: Timestamp,
}

impl ConnectOptions {
    pub fn new(client: impl Into<Arc<str>>) -> Self {
        Self {
            client: client.into(),
            user: None,
            writer: None,
            timestamp: 0,
        }
    }

    pub fn user(mut self, user: impl Into<Arc<str>>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn writer(mut self, writer: Arc<dyn Transport>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn timestamp(mut self, ts: Timestamp) -> Self {
        self.timestamp = ts;
        self
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("client", &self.client)
            .field("user", &self.user)
            .field("writer", &self.writer.is_some())
            .field("timestamp", &self.timestamp)
            .finish()
    }
}
