//! castlite-core - Core types for the castlite broadcast engine.
//!
//! This crate provides the building blocks shared between the engine and
//! its collaborators (transports, replication brokers, metrics collectors):
//! messages, timestamps, the subscription list, the replay history, batch
//! framing and the change log returned by every public engine call.

pub mod batch;
pub mod changelog;
pub mod error;
pub mod history;
pub mod message;
pub mod subscription;
pub mod time;
pub mod varint;

pub use batch::{decode_frame, BatchEncoder, MAX_PAYLOAD_SIZE};
pub use changelog::{ChangeLog, EntityKind, NotFound};
pub use error::{Error, FrameError, Result};
pub use history::{History, ReplayPointer, Snapshot};
pub use message::{GroupKey, Message};
pub use subscription::{Subscription, SubscriptionList};
pub use time::{now, Timestamp};
