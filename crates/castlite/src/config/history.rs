//! Replay history configuration.

use serde::Deserialize;

/// Default messages retained per group.
pub const DEFAULT_HISTORY_CAPACITY: usize = 256;

/// History configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Messages retained per topic/user group for reconnect replay.
    /// 0 disables replay; writer-less sessions then buffer raw messages.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}
