//! castlite - Embeddable real-time pub/sub broadcast engine.
//!
//! Clients connect with a [`Transport`], subscribe to topics directly or
//! through their user, and receive published payloads as length-prefixed
//! batch frames written by a pool of flush workers. Clients that go
//! inactive keep their state for a configurable TTL and have missed traffic
//! replayed from per-group history when they reconnect.

pub mod broadcast;
pub mod config;
pub mod engine;
pub mod gc;
pub mod metrics;
pub mod transport;

pub use castlite_core::{
    decode_frame, ChangeLog, EntityKind, Error, GroupKey, Message, NotFound, Result, Timestamp,
};

pub use crate::config::{Config, ConfigError};
pub use crate::engine::{ClientInfo, ClientStatus, ConnectOptions, Engine, Options, UserInfo};
pub use crate::metrics::MetricsSnapshot;
pub use crate::transport::{drain_payloads, ChannelTransport, Transport};
