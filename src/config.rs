//! Configuration management for aegis-ratelimit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{AegisError, Result};
use crate::ratelimit::{LimitRule, RateLimiter, TimeWindow};
use crate::storage::{BucketStore, FileStore, MemoryStore, DEFAULT_LOCK_TIMEOUT, DEFAULT_PREFIX};

/// Prefix for environment variable overrides, e.g. `AEGIS_STORAGE__DIRECTORY`.
pub const ENV_PREFIX: &str = "AEGIS";

/// Name of the limit used when none is specified.
pub const DEFAULT_LIMIT_NAME: &str = "default";

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AegisConfig {
    /// Storage backend configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Named rate limit rules
    #[serde(default = "default_limits")]
    pub limits: HashMap<String, LimitRule>,
}

impl Default for AegisConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            limits: default_limits(),
        }
    }
}

fn default_limits() -> HashMap<String, LimitRule> {
    HashMap::from([(
        DEFAULT_LIMIT_NAME.to_string(),
        LimitRule::new(60, TimeWindow::Minute),
    )])
}

/// Which storage backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process map, lost on exit
    Memory,
    /// One JSON file per key in a directory
    File,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend kind
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    /// Directory for the file backend
    #[serde(default = "default_directory")]
    pub directory: PathBuf,

    /// File name prefix for the file backend
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// File lock timeout in milliseconds
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            directory: default_directory(),
            prefix: default_prefix(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

fn default_backend() -> BackendKind {
    BackendKind::File
}

fn default_directory() -> PathBuf {
    std::env::temp_dir().join("aegis-ratelimit")
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_lock_timeout_ms() -> u64 {
    DEFAULT_LOCK_TIMEOUT.as_millis() as u64
}

impl StorageConfig {
    /// Lock timeout as a duration.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Open the configured backend.
    pub fn build_store(&self) -> Result<Arc<dyn BucketStore>> {
        match self.backend {
            BackendKind::Memory => Ok(Arc::new(MemoryStore::new())),
            BackendKind::File => {
                let store = FileStore::with_prefix(&self.directory, &self.prefix)?
                    .with_lock_timeout(self.lock_timeout());
                Ok(Arc::new(store))
            }
        }
    }
}

impl AegisConfig {
    /// Load configuration from an optional file, overridden by
    /// `AEGIS_`-prefixed environment variables (`__` separates sections).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__"),
        );

        builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| AegisError::Config(format!("Failed to load configuration: {}", e)))
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| AegisError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Look up a named limit rule.
    pub fn limit(&self, name: &str) -> Result<&LimitRule> {
        self.limits
            .get(name)
            .ok_or_else(|| AegisError::Config(format!("Unknown limit: {}", name)))
    }

    /// Build the rate limiter for a named rule over `store`.
    ///
    /// Keys are namespaced by the rule name, so limits sharing a store never
    /// touch each other's buckets.
    pub fn limiter(&self, name: &str, store: Arc<dyn BucketStore>) -> Result<RateLimiter> {
        Ok(RateLimiter::from_rule(self.limit(name)?, store)?.with_namespace(name))
    }
}
