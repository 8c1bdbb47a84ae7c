//! Logical timestamps.
//!
//! Every mutation carries a caller-supplied timestamp (nanoseconds since the
//! Unix epoch by convention). Zero means "unset" and is replaced with
//! [`now`] at the engine boundary.

use std::time::{SystemTime, UNIX_EPOCH};

/// Logical timestamp used for last-write-wins ordering.
pub type Timestamp = i64;

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as Timestamp)
        .unwrap_or(0)
}

/// Replace an unset (zero) timestamp with the current time.
#[inline]
pub fn stamp(ts: Timestamp) -> Timestamp {
    if ts == 0 {
        now()
    } else {
        ts
    }
}
