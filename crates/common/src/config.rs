//! Application configuration.

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::error::{AppError, AppResult};

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Redis configuration.
    pub redis: RedisConfig,
    /// Delayed queue configuration.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Downstream services.
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

/// A downstream service batches can be routed to.
///
/// Names live in values rather than table keys because the config loader
/// lowercases keys, and routing matches the name exactly.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceConfig {
    /// Service name as it appears in batch keys, e.g. `Conversation`.
    pub name: String,
    /// Base URL the service's methods are posted to.
    pub url: String,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Redis configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL.
    pub url: String,
    /// Number of pooled connections.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Per-command timeout in seconds.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Interval between connection health checks in seconds.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

/// Delayed queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Head queues: queue name to batching delay in seconds.
    #[serde(default)]
    pub heads: HashMap<String, u64>,
    /// Upper bound on how long a dispatcher sleeps between schedule checks.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Lifetime of a claim lock before the store expires it.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// Pause after a store failure before the dispatcher retries.
    #[serde(default = "default_store_retry_ms")]
    pub store_retry_ms: u64,
    /// Backoff applied when a downstream delivery fails.
    #[serde(default)]
    pub retry: RetrySettings,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            heads: HashMap::new(),
            poll_interval_ms: default_poll_interval_ms(),
            lock_ttl_secs: default_lock_ttl_secs(),
            store_retry_ms: default_store_retry_ms(),
            retry: RetrySettings::default(),
        }
    }
}

impl QueueConfig {
    /// Poll interval as a [`Duration`].
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Lock lifetime as a [`Duration`].
    #[must_use]
    pub const fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    /// Store retry pause as a [`Duration`].
    #[must_use]
    pub const fn store_retry(&self) -> Duration {
        Duration::from_millis(self.store_retry_ms)
    }
}

/// Delivery retry settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    /// Delay before the first retry, in seconds.
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,
    /// Cap on the retry delay, in seconds.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Growth factor between consecutive retries.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            multiplier: default_multiplier(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    23334
}

const fn default_pool_size() -> usize {
    4
}

const fn default_command_timeout_secs() -> u64 {
    5
}

const fn default_heartbeat_secs() -> u64 {
    30
}

const fn default_poll_interval_ms() -> u64 {
    1000
}

const fn default_lock_ttl_secs() -> u64 {
    300
}

const fn default_store_retry_ms() -> u64 {
    1000
}

const fn default_initial_delay_secs() -> u64 {
    30
}

const fn default_max_delay_secs() -> u64 {
    3600
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `.env` (if present)
    /// 2. `config/default.toml`
    /// 3. `config/{environment}.toml` (based on `HUDDLE_ENV`)
    /// 4. Environment variables with `HUDDLE_` prefix
    pub fn load() -> AppResult<Self> {
        dotenvy::dotenv().ok();
        let env = std::env::var("HUDDLE_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("HUDDLE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("HUDDLE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the queue cannot run with.
    pub fn validate(&self) -> AppResult<()> {
        if self.redis.pool_size == 0 {
            return Err(AppError::Config(
                "redis.pool_size must be greater than 0".to_string(),
            ));
        }
        if let Some((name, _)) = self.queue.heads.iter().find(|(_, delay)| **delay == 0) {
            return Err(AppError::Config(format!(
                "queue.heads.{name} must have a delay greater than 0"
            )));
        }
        let mut names = HashSet::new();
        for service in &self.services {
            if service.name.is_empty() || service.name.contains(',') {
                return Err(AppError::Config(format!(
                    "invalid service name {:?}",
                    service.name
                )));
            }
            if !names.insert(service.name.as_str()) {
                return Err(AppError::Config(format!(
                    "service {} is configured twice",
                    service.name
                )));
            }
        }
        Ok(())
    }
}
