//! Configuration management for subcast
//!
//! Every tunable of the callback subsystem lives here: sequencing limits on
//! the receiving side, fan-out and circuit-breaker limits on the publishing
//! side, capability cache TTL, storage backend. Configuration can be loaded
//! from a TOML file or from `SUBCAST_<SECTION>_<KEY>` environment variables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

use crate::capabilities::options;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local actor identity and HTTP endpoint
    pub server: ServerConfig,

    /// Receiver-side sequencing
    pub callbacks: CallbackConfig,

    /// Publisher-side delivery
    pub fanout: FanOutConfig,

    /// Peer capability discovery
    pub capabilities: CapabilityConfig,

    /// Attribute store backend
    pub store: StoreConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,

    /// Trusted peers: peer id -> actor root URL. The receiver reads a
    /// publisher's state from here after a resync.
    pub peers: BTreeMap<String, String>,
}

/// Local actor and endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Receiving endpoint bind address
    pub bind_address: SocketAddr,

    /// Identifier of the local actor, sent as `id` in every callback
    pub actor_id: String,

    /// Public root URL of the local actor; fetch-back URLs are built from it
    pub base_url: String,

    /// Version string served at the capability version resource
    pub protocol_version: String,

    /// Option tags advertised at the capability resource
    pub supported_options: Vec<String>,
}

/// CallbackProcessor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackConfig {
    /// Maximum out-of-order callbacks buffered per (peer, subscription)
    pub max_pending: usize,

    /// Age of the oldest pending callback after which a resync is forced
    #[serde(with = "humantime_serde")]
    pub gap_timeout: Duration,

    /// Optimistic-lock retries before a callback is rejected
    pub max_retries: u32,

    /// Base of the exponential backoff between retries
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,

    /// Value of the `Retry-After` header on 429 responses
    #[serde(with = "humantime_serde")]
    pub retry_after: Duration,
}

/// FanOutManager and circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FanOutConfig {
    /// Maximum concurrent outbound callback requests per delivery batch
    pub max_concurrent: usize,

    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Serialized payloads above this size are sent as low granularity
    pub max_payload_for_high_granularity: usize,

    /// Bodies above this size are gzipped for peers that support it
    pub compression_threshold: usize,

    /// Consecutive failures before a peer's breaker opens
    pub failure_threshold: u32,

    /// Time an open breaker waits before allowing a trial request
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
}

/// PeerCapabilityCache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    /// Age after which a cached capability entry is re-fetched
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Timeout for capability discovery and fetch-back requests
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,

    /// Wait before fetching again from a peer whose last fetch failed
    #[serde(with = "humantime_serde")]
    pub failure_retry: Duration,
}

/// Attribute store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "sqlite" => Ok(StoreBackend::Sqlite),
            other => Err(ConfigError::InvalidValue(format!("Invalid store backend: {}", other))),
        }
    }
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// SQLite database file (sqlite backend only)
    pub path: PathBuf,

    /// Connection pool size (sqlite backend only)
    pub pool_size: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include timestamps
    pub with_timestamp: bool,

    /// Include target module
    pub with_target: bool,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Register metric descriptions at startup
    pub enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 8080)),
            actor_id: "local".to_string(),
            base_url: "http://127.0.0.1:8080".to_string(),
            protocol_version: crate::PROTOCOL_VERSION.to_string(),
            supported_options: vec![
                options::SUBSCRIPTION_RESYNC.to_string(),
                options::CALLBACK_COMPRESSION.to_string(),
            ],
        }
    }
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            max_pending: 100,
            gap_timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
            retry_after: Duration::from_secs(1),
        }
    }
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            request_timeout: Duration::from_secs(10),
            max_payload_for_high_granularity: 64 * 1024,
            compression_threshold: 1024,
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            fetch_timeout: Duration::from_secs(5),
            failure_retry: Duration::from_secs(5 * 60),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            path: PathBuf::from("./data/subcast.db"),
            pool_size: 8,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Read `SUBCAST_<name>` and parse it, leaving `slot` untouched when unset.
fn env_override<T>(name: &str, slot: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = env::var(format!("SUBCAST_{}", name)) {
        *slot = raw
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("SUBCAST_{}: {}", name, e)))?;
    }
    Ok(())
}

/// Same as [`env_override`] for humantime durations such as `250ms` or `5s`.
fn env_duration(name: &str, slot: &mut Duration) -> Result<(), ConfigError> {
    if let Ok(raw) = env::var(format!("SUBCAST_{}", name)) {
        *slot = humantime_serde::re::humantime::parse_duration(&raw)
            .map_err(|e| ConfigError::InvalidValue(format!("SUBCAST_{}: {}", name, e)))?;
    }
    Ok(())
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables follow the pattern: SUBCAST_<SECTION>_<KEY>
    /// Example: SUBCAST_FANOUT_MAX_CONCURRENT=32
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        env_override("SERVER_BIND_ADDRESS", &mut config.server.bind_address)?;
        env_override("SERVER_ACTOR_ID", &mut config.server.actor_id)?;
        env_override("SERVER_BASE_URL", &mut config.server.base_url)?;
        if let Ok(tags) = env::var("SUBCAST_SERVER_SUPPORTED_OPTIONS") {
            config.server.supported_options = options::parse_tag_list(&tags).into_iter().collect();
        }

        env_override("CALLBACKS_MAX_PENDING", &mut config.callbacks.max_pending)?;
        env_duration("CALLBACKS_GAP_TIMEOUT", &mut config.callbacks.gap_timeout)?;
        env_override("CALLBACKS_MAX_RETRIES", &mut config.callbacks.max_retries)?;
        env_duration("CALLBACKS_RETRY_BACKOFF", &mut config.callbacks.retry_backoff)?;

        env_override("FANOUT_MAX_CONCURRENT", &mut config.fanout.max_concurrent)?;
        env_duration("FANOUT_REQUEST_TIMEOUT", &mut config.fanout.request_timeout)?;
        env_override(
            "FANOUT_MAX_PAYLOAD_FOR_HIGH_GRANULARITY",
            &mut config.fanout.max_payload_for_high_granularity,
        )?;
        env_override("FANOUT_COMPRESSION_THRESHOLD", &mut config.fanout.compression_threshold)?;
        env_override("FANOUT_FAILURE_THRESHOLD", &mut config.fanout.failure_threshold)?;
        env_duration("FANOUT_COOLDOWN", &mut config.fanout.cooldown)?;

        env_duration("CAPABILITIES_TTL", &mut config.capabilities.ttl)?;
        env_duration("CAPABILITIES_FETCH_TIMEOUT", &mut config.capabilities.fetch_timeout)?;
        env_duration("CAPABILITIES_FAILURE_RETRY", &mut config.capabilities.failure_retry)?;

        env_override("STORE_BACKEND", &mut config.store.backend)?;
        if let Ok(path) = env::var("SUBCAST_STORE_PATH") {
            config.store.path = PathBuf::from(path);
        }

        env_override("LOG_LEVEL", &mut config.logging.level)?;
        env_override("LOG_JSON", &mut config.logging.json_format)?;
        env_override("METRICS_ENABLED", &mut config.metrics.enabled)?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.actor_id.is_empty() {
            return Err(ConfigError::ValidationFailed("actor_id must not be empty".to_string()));
        }

        if !self.server.base_url.starts_with("http://") && !self.server.base_url.starts_with("https://")
        {
            return Err(ConfigError::ValidationFailed(format!(
                "base_url must be an http(s) URL: {}",
                self.server.base_url
            )));
        }

        if self.callbacks.max_pending == 0 {
            return Err(ConfigError::ValidationFailed(
                "callbacks.max_pending must be greater than 0".to_string(),
            ));
        }

        if self.callbacks.gap_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "callbacks.gap_timeout must be greater than 0".to_string(),
            ));
        }

        if self.fanout.max_concurrent == 0 {
            return Err(ConfigError::ValidationFailed(
                "fanout.max_concurrent must be greater than 0".to_string(),
            ));
        }

        if self.fanout.failure_threshold == 0 {
            return Err(ConfigError::ValidationFailed(
                "fanout.failure_threshold must be greater than 0".to_string(),
            ));
        }

        if self.fanout.request_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "fanout.request_timeout must be greater than 0".to_string(),
            ));
        }

        for (peer_id, url) in &self.peers {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::ValidationFailed(format!(
                    "peers.{} must be an http(s) URL: {}",
                    peer_id, url
                )));
            }
        }

        if self.store.backend == StoreBackend::Sqlite && self.store.pool_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "store.pool_size must be greater than 0".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError(e.to_string()))?;

        Ok(())
    }
}
