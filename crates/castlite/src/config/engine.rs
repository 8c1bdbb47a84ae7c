//! Engine sharding configuration.

use serde::Deserialize;

/// Shards per CPU when `shards = 0`.
pub const SHARDS_PER_CPU: usize = 4;

/// Upper bound on the shard count.
pub const MAX_SHARDS: usize = 4096;

/// Engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of registry shards (0 = auto: 4 per CPU).
    pub shards: usize,
}

impl EngineConfig {
    /// Effective shard count.
    pub fn shard_count(&self) -> usize {
        if self.shards == 0 {
            (num_cpus::get() * SHARDS_PER_CPU).min(MAX_SHARDS)
        } else {
            self.shards
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.shards > MAX_SHARDS {
            return Err(format!("engine.shards cannot exceed {}", MAX_SHARDS));
        }
        Ok(())
    }
}
