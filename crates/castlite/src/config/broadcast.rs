//! Broadcaster configuration: flush workers, work queue and batching.

use serde::Deserialize;

/// Default work queue capacity (flush units).
pub const DEFAULT_QUEUE_CAPACITY: usize = 65_536;

/// Default maximum frame size in bytes.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 64 * 1024;

/// Default cap on messages buffered for a writer-less session.
pub const DEFAULT_MAX_SESSION_BUFFER: usize = 1024;

/// Broadcaster configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Number of flush worker threads (0 = one per CPU).
    pub workers: usize,

    /// Capacity of the bounded work queue. When full, producers block.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Maximum frame size in bytes. Larger single messages get their own frame.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Messages kept for a session while it has no writer; oldest are evicted.
    #[serde(default = "default_max_session_buffer")]
    pub max_session_buffer: usize,
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}
fn default_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}
fn default_max_session_buffer() -> usize {
    DEFAULT_MAX_SESSION_BUFFER
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_session_buffer: DEFAULT_MAX_SESSION_BUFFER,
        }
    }
}

impl BroadcastConfig {
    /// Effective worker count.
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.queue_capacity == 0 {
            return Err("broadcast.queue_capacity must be at least 1".into());
        }
        if self.max_batch_size == 0 {
            return Err("broadcast.max_batch_size must be at least 1".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(BroadcastConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_queue_rejected() {
        let config = BroadcastConfig {
            queue_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_auto_workers() {
        assert!(BroadcastConfig::default().worker_count() >= 1);
        let config = BroadcastConfig {
            workers: 3,
            ..Default::default()
        };
        assert_eq!(config.worker_count(), 3);
    }
}
