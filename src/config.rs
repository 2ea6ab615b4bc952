//! Configuration management for the TalkTime rate limit service.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TalkTimeError};
use crate::mesh::ClusterConfig;
use crate::ratelimit::{
    FailurePolicy, LimitConfig, RedisStoreConfig, DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW_MS,
};

/// Prefix for environment overrides, e.g. `TALKTIME__RATE_LIMITING__MAX_REQUESTS=20`.
pub const ENV_PREFIX: &str = "TALKTIME";

/// Main configuration for the service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TalkTimeConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Shared state backend
    #[serde(default)]
    pub backend: BackendConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8787))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Sliding window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Admitted requests per identifier per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// Seconds between eviction sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_requests: default_max_requests(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_window_ms() -> u64 {
    DEFAULT_WINDOW_MS
}

fn default_max_requests() -> u32 {
    DEFAULT_MAX_REQUESTS
}

fn default_sweep_interval() -> u64 {
    60
}

impl RateLimitingConfig {
    /// Validate into limiter parameters.
    pub fn limit_config(&self) -> Result<LimitConfig> {
        LimitConfig::new(self.window_ms, self.max_requests)
    }

    /// Interval between sweeps.
    pub fn sweep_interval(&self) -> Result<Duration> {
        if self.sweep_interval_secs == 0 {
            return Err(TalkTimeError::Config(
                "sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(Duration::from_secs(self.sweep_interval_secs))
    }
}

/// Which store holds request logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Process-local logs
    #[default]
    Memory,
    /// Shared Redis sorted sets
    Redis,
    /// Gossip mesh between service nodes
    Cluster,
}

/// Shared state backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,

    /// Answer when a shared store is unavailable
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Bound on a single store round-trip in milliseconds
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,

    #[serde(default)]
    pub redis: RedisSettings,

    #[serde(default)]
    pub cluster: ClusterSettings,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            failure_policy: FailurePolicy::default(),
            store_timeout_ms: default_store_timeout(),
            redis: RedisSettings::default(),
            cluster: ClusterSettings::default(),
        }
    }
}

fn default_store_timeout() -> u64 {
    250
}

impl BackendConfig {
    /// Store round-trip bound.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

/// Redis connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    #[serde(default = "default_redis_url")]
    pub url: String,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1/".to_string()
}

fn default_key_prefix() -> String {
    "talktime:ratelimit:".to_string()
}

impl From<&RedisSettings> for RedisStoreConfig {
    fn from(settings: &RedisSettings) -> Self {
        RedisStoreConfig {
            url: settings.url.clone(),
            key_prefix: settings.key_prefix.clone(),
        }
    }
}

/// Gossip mesh settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// Node identifier; a random UUID when unset
    #[serde(default)]
    pub node_id: Option<String>,

    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,

    /// Defaults to the listen address
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,

    #[serde(default)]
    pub seed_nodes: Vec<String>,

    #[serde(default)]
    pub cluster_id: Option<String>,

    #[serde(default)]
    pub gossip_interval_ms: Option<u64>,
}

impl From<&ClusterSettings> for ClusterConfig {
    fn from(settings: &ClusterSettings) -> Self {
        let defaults = ClusterConfig::default();
        let listen_addr = settings.listen_addr.unwrap_or(defaults.listen_addr);
        ClusterConfig {
            node_id: settings.node_id.clone().unwrap_or(defaults.node_id),
            listen_addr,
            advertise_addr: settings.advertise_addr.unwrap_or(listen_addr),
            seed_nodes: settings.seed_nodes.clone(),
            cluster_id: settings.cluster_id.clone().unwrap_or(defaults.cluster_id),
            gossip_interval: settings
                .gossip_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.gossip_interval),
            dead_node_grace_period: defaults.dead_node_grace_period,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,

    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TalkTimeConfig {
    /// Load configuration from an optional YAML file layered under
    /// `TALKTIME__`-prefixed environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml).required(true),
            );
        }

        let config: TalkTimeConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("backend.cluster.seed_nodes"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TalkTimeConfig =
            serde_yaml::from_str(yaml).map_err(|e| TalkTimeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.rate_limiting.limit_config()?;
        self.rate_limiting.sweep_interval()?;
        if self.backend.kind != BackendKind::Memory && self.backend.store_timeout_ms == 0 {
            return Err(TalkTimeError::Config(
                "store_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
