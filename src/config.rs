//! Configuration management for ratelimit-io.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RatelimitError, Result};
use crate::ratelimit::{LimitSpec, Mode};

/// Prefix of environment variables overriding file configuration.
pub const ENV_PREFIX: &str = "RATELIMIT_IO";

/// Main configuration for the ratelimit-io binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatelimitIoConfig {
    /// Store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Engine defaults
    #[serde(default)]
    pub limiter: LimiterConfig,
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Connection URL of the shared store
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Maximum pooled connections held by a blocking store
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// How long to wait for a connection, in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// How long to wait for a reply to one command, in milliseconds
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

impl StoreConfig {
    /// Connect timeout as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Response timeout as a duration.
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            pool_size: default_pool_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
        }
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_pool_size() -> u32 {
    16
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_response_timeout_ms() -> u64 {
    1000
}

/// Defaults applied by an [`AdmissionEngine`](crate::ratelimit::AdmissionEngine).
///
/// Immutable once the engine is built; per-call values override it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Limit used when a call does not supply one
    #[serde(default)]
    pub default_limit: Option<LimitSpec>,

    /// Key used when a call supplies neither a key nor a unique key
    #[serde(default)]
    pub default_key: Option<String>,

    /// How denials are handled unless a call says otherwise
    #[serde(default)]
    pub mode: Mode,
}

impl LimiterConfig {
    /// Outgoing mode with no default key or limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default limit.
    pub fn with_default_limit(mut self, limit: LimitSpec) -> Self {
        self.default_limit = Some(limit);
        self
    }

    /// Set the default key.
    pub fn with_default_key(mut self, key: impl Into<String>) -> Self {
        self.default_key = Some(key.into());
        self
    }

    /// Set the default mode.
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }
}

impl RatelimitIoConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RatelimitError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from an optional file overlaid with environment variables.
    ///
    /// Variables use the `RATELIMIT_IO__` prefix and `__` as the nesting
    /// separator, e.g. `RATELIMIT_IO__STORE__URL`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(config::File::from(path));
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|e| RatelimitError::Config(e.to_string()))
    }
}
