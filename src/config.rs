//! TOML-based store configuration.
//!
//! ```toml
//! lock_timeout_ms = 5000
//!
//! [backend]
//! type = "git"
//! path = ".revdb"
//!
//! [retry]
//! max_attempts = 4
//!
//! [merge]
//! last_writer_wins = ["effectiveTime"]
//! ```
//!
//! Every section is optional; a missing file yields the defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::merge::MergeRules;
use crate::retry::RetryPolicy;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration value for '{field}': {detail}")]
    Invalid { field: String, detail: String },
}

impl ConfigError {
    fn invalid(field: &str, detail: &str) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            detail: detail.to_string(),
        }
    }
}

/// Where documents are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Process-local maps; nothing survives a restart.
    #[default]
    Memory,
    /// A git repository at `path`, created when missing.
    Git { path: PathBuf },
}

/// Retry settings for retryable index failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_backoff_ms: policy.initial_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: BackendConfig,
    /// How long a writer waits for a branch lock.
    pub lock_timeout_ms: u64,
    pub retry: RetryConfig,
    pub merge: MergeRules,
    /// Reject commits that duplicate a configured natural key.
    pub enforce_natural_keys: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            lock_timeout_ms: default_lock_timeout_ms(),
            retry: RetryConfig::default(),
            merge: MergeRules::default(),
            enforce_natural_keys: false,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for a git-backed store at `path`.
    pub fn git(path: impl Into<PathBuf>) -> Self {
        Self::default().with_backend(BackendConfig::Git { path: path.into() })
    }

    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_merge_rules(mut self, rules: MergeRules) -> Self {
        self.merge = rules;
        self
    }

    pub fn enforce_natural_keys(mut self, value: bool) -> Self {
        self.enforce_natural_keys = value;
        self
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.policy()
    }

    /// Load and validate a configuration file. A missing file yields the
    /// defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "no configuration file, using defaults");
            return Ok(Self::default());
        }
        info!(path = %path.display(), "loading configuration");
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: StoreConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_timeout_ms == 0 {
            return Err(ConfigError::invalid("lock_timeout_ms", "lock timeout must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "at least one attempt is required"));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::invalid(
                "retry.initial_backoff_ms",
                "initial backoff must not exceed max_backoff_ms",
            ));
        }
        if let BackendConfig::Git { path } = &self.backend {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::invalid("backend.path", "git backend needs a path"));
            }
        }
        Ok(())
    }
}
