//! Engine configuration.
//!
//! Supports configuration from:
//! - TOML file (default: `castlite.toml`)
//! - Environment variables with `CASTLITE__` prefix (double underscore for nesting)
//! - In-file variable substitution: `${VAR}` or `${VAR:-default}`
//!
//! Environment variable examples:
//! - `CASTLITE__ENGINE__SHARDS=64`
//! - `CASTLITE__BROADCAST__WORKERS=8`
//! - `CASTLITE__HISTORY__CAPACITY=1024`
//!
//! In-file substitution examples:
//! ```toml
//! [gc]
//! ttl_secs = ${CASTLITE_GC_TTL:-60}
//! ```

mod broadcast;
mod engine;
mod gc;
mod history;
mod log;

use std::path::Path;
use std::sync::LazyLock;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use broadcast::{
    BroadcastConfig, DEFAULT_MAX_BATCH_SIZE, DEFAULT_MAX_SESSION_BUFFER, DEFAULT_QUEUE_CAPACITY,
};
pub use engine::{EngineConfig, MAX_SHARDS, SHARDS_PER_CPU};
pub use gc::{GcConfig, DEFAULT_GC_INTERVAL_MS, DEFAULT_GC_TTL_SECS};
pub use history::{HistoryConfig, DEFAULT_HISTORY_CAPACITY};
pub use log::LogConfig;

static ENV_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("static pattern"));

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    ENV_VAR
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string()
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub log: LogConfig,
    /// Shard layout.
    pub engine: EngineConfig,
    /// Flush workers, work queue and batching.
    pub broadcast: BroadcastConfig,
    /// Reconnect replay window.
    pub history: HistoryConfig,
    /// Inactive client eviction.
    pub gc: GcConfig,
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    Io(std::io::Error),
    /// Config parsing/loading error.
    Config(config::ConfigError),
    /// Invalid configuration value.
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    /// Overrides use the `CASTLITE__` prefix with double underscores for nesting:
    ///    - `CASTLITE__ENGINE__SHARDS=64`
    ///    - `CASTLITE__GC__TTL_SECS=30`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("engine.shards", 0)?
            .set_default("broadcast.workers", 0)?
            .set_default("broadcast.queue_capacity", DEFAULT_QUEUE_CAPACITY as i64)?
            .set_default("broadcast.max_batch_size", DEFAULT_MAX_BATCH_SIZE as i64)?
            .set_default(
                "broadcast.max_session_buffer",
                DEFAULT_MAX_SESSION_BUFFER as i64,
            )?
            .set_default("history.capacity", DEFAULT_HISTORY_CAPACITY as i64)?
            .set_default("gc.ttl_secs", DEFAULT_GC_TTL_SECS as i64)?
            .set_default("gc.interval_ms", DEFAULT_GC_INTERVAL_MS as i64)?;

        let path = path.as_ref();
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let substituted = substitute_env_vars(&content);
            builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("CASTLITE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let substituted = substitute_env_vars(content);
        let config: Config = toml::from_str(&substituted)
            .map_err(|e| ConfigError::Validation(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate().map_err(ConfigError::Validation)?;
        self.broadcast.validate().map_err(ConfigError::Validation)?;
        Ok(())
    }
}
