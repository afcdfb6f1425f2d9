//! Configuration management for Windowguard.
//!
//! Values are layered: built-in defaults, then an optional file, then
//! `WINDOWGUARD__<SECTION>__<FIELD>` environment variables. The legacy
//! `REDIS_ADDR` variable is honoured last.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, WindowGuardError};
use crate::ratelimit::{FailurePolicy, WindowPolicy};

/// Environment variable prefix for layered overrides.
const ENV_PREFIX: &str = "WINDOWGUARD";
/// Legacy `host:port` override for the Redis address.
const REDIS_ADDR_VAR: &str = "REDIS_ADDR";

/// Main configuration for the Windowguard service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowGuardConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Coordination store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// How long in-flight requests may drain after a shutdown signal
    #[serde(default = "default_grace_period")]
    pub shutdown_grace_period_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            shutdown_grace_period_ms: default_grace_period(),
        }
    }
}

impl ServerConfig {
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_grace_period() -> u64 {
    5000
}

/// Which coordination store backs the limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis instance; correct across any number of processes
    #[default]
    Redis,
    /// In-process store; correct within a single process only
    Memory,
}

/// Coordination store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store implementation
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Optional deadline for a single evaluator round trip
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_store_url(),
            timeout_ms: None,
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

fn default_store_url() -> String {
    "redis://localhost:6379".to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Maximum admissions per trailing window
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Prefix joined to the caller identity to form the store key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// What to decide when the store cannot be consulted
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window_ms: default_window_ms(),
            key_prefix: default_key_prefix(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl RateLimitingConfig {
    /// The immutable window policy described by this section.
    pub fn policy(&self) -> WindowPolicy {
        WindowPolicy::new(self.limit, Duration::from_millis(self.window_ms))
    }
}

fn default_limit() -> u64 {
    5
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_key_prefix() -> String {
    "limit:".to_string()
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl WindowGuardConfig {
    /// Load configuration from defaults, an optional file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let mut config: WindowGuardConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        if let Ok(addr) = std::env::var(REDIS_ADDR_VAR) {
            config.apply_redis_addr(&addr);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string layered over the defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: WindowGuardConfig = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Point the store at a bare `host:port`, ignoring blank values.
    pub fn apply_redis_addr(&mut self, addr: &str) {
        let addr = addr.trim();
        if !addr.is_empty() {
            self.store.url = format!("redis://{}", addr);
        }
    }

    /// Reject policies that make no sense. Called once at construction time;
    /// the admission path never re-checks them.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limiting.window_ms == 0 {
            return Err(WindowGuardError::Config(
                "rate_limiting.window_ms must be greater than zero".to_string(),
            ));
        }
        if self.rate_limiting.key_prefix.is_empty() {
            return Err(WindowGuardError::Config(
                "rate_limiting.key_prefix must not be empty".to_string(),
            ));
        }
        if self.store.backend == StoreBackend::Redis && self.store.url.is_empty() {
            return Err(WindowGuardError::Config(
                "store.url is required for the redis backend".to_string(),
            ));
        }
        Ok(())
    }
}
