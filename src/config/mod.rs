// * Engine Configuration
// * TOML file plus environment overrides for state backend, baseline cache and telemetry

pub mod constants;

use constants::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub state: StateConfig,
    pub baseline: BaselineConfig,
    pub telemetry: TelemetryConfig,
}

/// Which store holds match counters and silence flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Single-process map; state does not survive restarts
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub backend: StateBackend,
    pub namespace: String,
    pub redis: RedisConfig,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackend::Memory,
            namespace: DEFAULT_NAMESPACE.to_string(),
            redis: RedisConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedisMode {
    #[default]
    Standalone,
    Cluster,
}

/// Redis connection settings
///
/// `host`/`port`/`database` apply to standalone mode; `nodes` (`host:port`)
/// and `max_redirects` apply to cluster mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub mode: RedisMode,
    pub host: String,
    pub port: u16,
    pub database: i64,
    pub nodes: Vec<String>,
    pub max_redirects: u32,
    pub username: Option<String>,
    pub password: Option<String>,
    pub pool: PoolConfig,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            mode: RedisMode::Standalone,
            host: DEFAULT_REDIS_HOST.to_string(),
            port: DEFAULT_REDIS_PORT,
            database: 0,
            nodes: Vec::new(),
            max_redirects: DEFAULT_CLUSTER_MAX_REDIRECTS,
            username: None,
            password: None,
            pool: PoolConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_size: u32,
    pub min_idle: u32,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub connection_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_POOL_MAX_SIZE,
            min_idle: DEFAULT_POOL_MIN_IDLE,
            idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            connection_timeout: DEFAULT_POOL_CONNECTION_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    pub smoothing_window: usize,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            cache_ttl: BASELINE_CACHE_TTL,
            smoothing_window: DEFAULT_SMOOTHING_WINDOW,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub json: bool,
    pub metrics_port: Option<u16>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: true,
            metrics_port: Some(DEFAULT_METRICS_PORT),
        }
    }
}

impl EngineConfig {
    /// Parses a TOML document and validates it
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a TOML file and validates it
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Loads from `APM_ALERT_CONFIG` when set, then applies environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(ENV_CONFIG_PATH) {
            Ok(path) => Self::load(path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(backend) = lookup(ENV_STATE_BACKEND) {
            self.state.backend = match backend.to_ascii_lowercase().as_str() {
                "memory" => StateBackend::Memory,
                "redis" => StateBackend::Redis,
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "unknown state backend '{}'",
                        other
                    )))
                }
            };
        }
        if let Some(namespace) = lookup(ENV_NAMESPACE) {
            self.state.namespace = namespace;
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.telemetry.log_level = level;
        }
        Ok(())
    }

    /// Checks cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.state.namespace.trim().is_empty() {
            return Err(ConfigError::Invalid("namespace must not be empty".into()));
        }
        if self.baseline.smoothing_window == 0 {
            return Err(ConfigError::Invalid(
                "baseline.smoothing_window must be at least 1".into(),
            ));
        }
        if self.baseline.cache_ttl.is_zero() {
            return Err(ConfigError::Invalid("baseline.cache_ttl must be positive".into()));
        }
        if self.state.backend == StateBackend::Redis {
            self.state.redis.validate()?;
        }
        Ok(())
    }
}

impl RedisConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pool = &self.pool;
        if pool.max_size == 0 {
            return Err(ConfigError::Invalid("redis.pool.max_size must be at least 1".into()));
        }
        if pool.min_idle > pool.max_size {
            return Err(ConfigError::Invalid(format!(
                "redis.pool.min_idle ({}) exceeds max_size ({})",
                pool.min_idle, pool.max_size
            )));
        }

        match self.mode {
            RedisMode::Standalone => {
                if self.host.trim().is_empty() {
                    return Err(ConfigError::Invalid("redis.host must not be empty".into()));
                }
                if self.database < 0 {
                    return Err(ConfigError::Invalid("redis.database must not be negative".into()));
                }
            }
            RedisMode::Cluster => {
                if self.nodes.is_empty() {
                    return Err(ConfigError::Invalid(
                        "cluster mode requires at least one node".into(),
                    ));
                }
                for node in &self.nodes {
                    parse_node(node)?;
                }
                if self.database != 0 {
                    return Err(ConfigError::Invalid(
                        "redis.database is not supported in cluster mode".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Splits a `host:port` cluster node
pub fn parse_node(node: &str) -> Result<(String, u16), ConfigError> {
    let invalid = || ConfigError::Invalid(format!("cluster node '{}' is not host:port", node));
    let (host, port) = node.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}
