//! Inactive client eviction configuration.

use std::time::Duration;

use serde::Deserialize;

/// Default time an inactive client is kept before eviction.
pub const DEFAULT_GC_TTL_SECS: u64 = 60;

/// Default interval between sweeps.
pub const DEFAULT_GC_INTERVAL_MS: u64 = 1000;

/// Garbage collector configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Seconds an inactive client stays reachable before it is evicted.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Milliseconds between collection sweeps. 0 disables the sweeper thread.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn default_ttl_secs() -> u64 {
    DEFAULT_GC_TTL_SECS
}
fn default_interval_ms() -> u64 {
    DEFAULT_GC_INTERVAL_MS
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_GC_TTL_SECS,
            interval_ms: DEFAULT_GC_INTERVAL_MS,
        }
    }
}

impl GcConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn interval(&self) -> Option<Duration> {
        (self.interval_ms > 0).then(|| Duration::from_millis(self.interval_ms))
    }
}
