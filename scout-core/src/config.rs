//! Service configuration: TOML file, overlaid by `SCOUT_*` environment variables.
//!
//! ```toml
//! [cache]
//! ttl_secs = 3600
//! external = true
//!
//! [cache.redis]
//! host = "10.0.0.5"
//! db = 2
//!
//! [store]
//! path = "data/scout.db"
//!
//! [retry]
//! max_attempts = 4
//! backoff_ms = 250
//!
//! [rate_limits.fbref]
//! rate = 0.2
//! burst = 1
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::ratelimit::RateLimit;
use crate::retry::RetryPolicy;

pub const ENV_CACHE_TTL_SECS: &str = "SCOUT_CACHE_TTL_SECS";
pub const ENV_CACHE_EXTERNAL: &str = "SCOUT_CACHE_EXTERNAL";
pub const ENV_REDIS_HOST: &str = "SCOUT_REDIS_HOST";
pub const ENV_REDIS_PORT: &str = "SCOUT_REDIS_PORT";
pub const ENV_REDIS_DB: &str = "SCOUT_REDIS_DB";
pub const ENV_REDIS_PREFIX: &str = "SCOUT_REDIS_PREFIX";
pub const ENV_STORE_PATH: &str = "SCOUT_STORE_PATH";
pub const ENV_RETRY_ATTEMPTS: &str = "SCOUT_RETRY_ATTEMPTS";
pub const ENV_RETRY_BACKOFF_MS: &str = "SCOUT_RETRY_BACKOFF_MS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, value: impl ToString, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Top-level configuration for the resilience core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoutConfig {
    pub cache: CacheConfig,
    pub store: StoreConfig,
    pub retry: RetryConfig,
    /// Per-source token bucket settings, keyed by source identifier.
    pub rate_limits: BTreeMap<String, RateLimitEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    /// Whether to use the external (Redis) tier at all.
    pub external: bool,
    pub redis: RedisConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            external: false,
            redis: RedisConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    /// Logical database index.
    pub db: i64,
    /// Prefix applied to every key so `clear` only touches our entries.
    pub prefix: String,
    pub connect_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 6379,
            db: 0,
            prefix: "scout:".into(),
            connect_timeout_ms: 500,
        }
    }
}

impl RedisConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file holding every stored table.
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/scout.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub max_backoff_ms: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 500,
            max_backoff_ms: None,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::new(self.max_attempts, Duration::from_millis(self.backoff_ms));
        match self.max_backoff_ms {
            Some(cap) => policy.with_max_backoff(Duration::from_millis(cap)),
            None => policy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitEntry {
    /// Sustained calls per second.
    pub rate: f64,
    /// Bucket capacity; defaults to twice the rate.
    pub burst: Option<f64>,
}

impl RateLimitEntry {
    pub fn to_limit(&self) -> Result<RateLimit, ConfigError> {
        match self.burst {
            Some(burst) => RateLimit::with_burst(self.rate, burst),
            None => RateLimit::new(self.rate),
        }
    }
}

impl ScoutConfig {
    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Defaults overlaid by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from an environment lookup. Unset variables leave the
    /// current value untouched.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_CACHE_TTL_SECS) {
            self.cache.ttl_secs = parse_env(ENV_CACHE_TTL_SECS, &v)?;
        }
        if let Some(v) = lookup(ENV_CACHE_EXTERNAL) {
            self.cache.external = parse_bool(ENV_CACHE_EXTERNAL, &v)?;
        }
        if let Some(v) = lookup(ENV_REDIS_HOST) {
            self.cache.redis.host = v;
        }
        if let Some(v) = lookup(ENV_REDIS_PORT) {
            self.cache.redis.port = parse_env(ENV_REDIS_PORT, &v)?;
        }
        if let Some(v) = lookup(ENV_REDIS_DB) {
            self.cache.redis.db = parse_env(ENV_REDIS_DB, &v)?;
        }
        if let Some(v) = lookup(ENV_REDIS_PREFIX) {
            self.cache.redis.prefix = v;
        }
        if let Some(v) = lookup(ENV_STORE_PATH) {
            self.store.path = PathBuf::from(v);
        }
        if let Some(v) = lookup(ENV_RETRY_ATTEMPTS) {
            self.retry.max_attempts = parse_env(ENV_RETRY_ATTEMPTS, &v)?;
        }
        if let Some(v) = lookup(ENV_RETRY_BACKOFF_MS) {
            self.retry.backoff_ms = parse_env(ENV_RETRY_BACKOFF_MS, &v)?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "retry.max_attempts",
                0,
                "at least one attempt is required",
            ));
        }
        if self.cache.redis.db < 0 {
            return Err(ConfigError::invalid(
                "cache.redis.db",
                self.cache.redis.db,
                "database index must be non-negative",
            ));
        }
        for (source, entry) in &self.rate_limits {
            entry.to_limit().map_err(|e| match e {
                ConfigError::InvalidValue { value, reason, .. } => ConfigError::InvalidValue {
                    key: format!("rate_limits.{source}"),
                    value,
                    reason,
                },
                other => other,
            })?;
        }
        Ok(())
    }

    /// Validated per-source limits.
    pub fn source_limits(&self) -> Result<Vec<(String, RateLimit)>, ConfigError> {
        self.rate_limits
            .iter()
            .map(|(source, entry)| Ok((source.clone(), entry.to_limit()?)))
            .collect()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(key, value, e.to_string()))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::invalid(key, value, "expected a boolean")),
    }
}
