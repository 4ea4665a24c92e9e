//! Configuration module for CloudFS.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for CloudFS.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mount: MountConfig,
    pub cache: CacheConfig,
    pub backend: BackendConfig,
    pub retry: RetryConfig,
    pub logging: LoggingConfig,
}

/// Capabilities negotiated once with the kernel at mount time.
///
/// These bound the content cache's internal batching and the flush engine's
/// chunk size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Maximum number of concurrent background backend operations.
    pub max_background: u16,
    /// Maximum single write / upload chunk size in bytes.
    pub max_write: u32,
    /// Maximum read-ahead window in bytes.
    pub max_readahead: u32,
}

/// Where file content is materialized locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Keep content in process memory.
    Memory,
    /// Keep content in sparse files under `cache_dir`.
    Disk,
}

/// Local content cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Storage medium for cached content.
    pub storage: StorageKind,
    /// Directory for disk-backed content (tilde is expanded).
    pub cache_dir: String,
}

/// Remote backend call settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Per-call timeout in seconds.
    pub timeout_secs: u64,
    /// How long a quota answer is reused by `statfs`, in seconds.
    pub statfs_ttl_secs: u64,
    /// How long a directory listing is trusted before it is fetched again,
    /// in seconds.
    #[serde(default = "default_listing_ttl_secs")]
    pub listing_ttl_secs: u64,
}

fn default_listing_ttl_secs() -> u64 {
    30
}

/// Retry policy for transient backend failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds; doubles on each retry.
    pub base_delay_ms: u64,
    /// Upper bound for a single backoff delay, in milliseconds.
    pub max_delay_ms: u64,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/cloudfs/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("cloudfs")
            .join("config.yaml")
    }
}

/// Expands a leading `~/` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

impl CacheConfig {
    /// The cache directory with `~` expanded.
    pub fn cache_path(&self) -> PathBuf {
        expand_tilde(&self.cache_dir)
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn statfs_ttl(&self) -> Duration {
        Duration::from_secs(self.statfs_ttl_secs)
    }

    pub fn listing_ttl(&self) -> Duration {
        Duration::from_secs(self.listing_ttl_secs)
    }
}

impl RetryConfig {
    /// Backoff delay before retry number `attempt` (0-based), capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            max_background: 20,
            max_write: 1024 * 1024,
            max_readahead: 10 * 1024 * 1024,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            storage: StorageKind::Disk,
            cache_dir: "~/.cache/cloudfs".to_string(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            statfs_ttl_secs: 10,
            listing_ttl_secs: default_listing_ttl_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1000,
            max_delay_ms: 16_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"mount.max_write"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
pub const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Smallest accepted `mount.max_write` (one page).
const MIN_MAX_WRITE: u32 = 4096;

/// Largest accepted `mount.max_write` (128 MiB).
const MAX_MAX_WRITE: u32 = 128 * 1024 * 1024;

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- mount ---
        if self.mount.max_background == 0 {
            errors.push(ValidationError {
                field: "mount.max_background".into(),
                message: "must be greater than 0".into(),
            });
        }
        if !(MIN_MAX_WRITE..=MAX_MAX_WRITE).contains(&self.mount.max_write) {
            errors.push(ValidationError {
                field: "mount.max_write".into(),
                message: format!("must be in range {MIN_MAX_WRITE}..={MAX_MAX_WRITE}"),
            });
        }
        if self.mount.max_readahead == 0 {
            errors.push(ValidationError {
                field: "mount.max_readahead".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- cache ---
        if self.cache.storage == StorageKind::Disk && self.cache.cache_dir.trim().is_empty() {
            errors.push(ValidationError {
                field: "cache.cache_dir".into(),
                message: "must be set when storage is 'disk'".into(),
            });
        }

        // --- backend ---
        if self.backend.timeout_secs == 0 {
            errors.push(ValidationError {
                field: "backend.timeout_secs".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- retry ---
        if self.retry.max_retries > 10 {
            errors.push(ValidationError {
                field: "retry.max_retries".into(),
                message: "must be in range 0..=10".into(),
            });
        }
        if self.retry.base_delay_ms == 0 {
            errors.push(ValidationError {
                field: "retry.base_delay_ms".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            errors.push(ValidationError {
                field: "retry.max_delay_ms".into(),
                message: format!(
                    "max_delay_ms ({}) must not be below base_delay_ms ({})",
                    self.retry.max_delay_ms, self.retry.base_delay_ms
                ),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use cloudfs_core::config::{ConfigBuilder, StorageKind};
///
/// let config = ConfigBuilder::new()
///     .cache_storage(StorageKind::Memory)
///     .mount_max_write(256 * 1024)
///     .retry_base_delay_ms(50)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- mount ---

    pub fn mount_max_background(mut self, n: u16) -> Self {
        self.config.mount.max_background = n;
        self
    }

    pub fn mount_max_write(mut self, bytes: u32) -> Self {
        self.config.mount.max_write = bytes;
        self
    }

    pub fn mount_max_readahead(mut self, bytes: u32) -> Self {
        self.config.mount.max_readahead = bytes;
        self
    }

    // --- cache ---

    pub fn cache_storage(mut self, storage: StorageKind) -> Self {
        self.config.cache.storage = storage;
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<String>) -> Self {
        self.config.cache.cache_dir = dir.into();
        self
    }

    // --- backend ---

    pub fn backend_timeout_secs(mut self, seconds: u64) -> Self {
        self.config.backend.timeout_secs = seconds;
        self
    }

    pub fn backend_statfs_ttl_secs(mut self, seconds: u64) -> Self {
        self.config.backend.statfs_ttl_secs = seconds;
        self
    }

    pub fn backend_listing_ttl_secs(mut self, seconds: u64) -> Self {
        self.config.backend.listing_ttl_secs = seconds;
        self
    }

    // --- retry ---

    pub fn retry_max_retries(mut self, n: u32) -> Self {
        self.config.retry.max_retries = n;
        self
    }

    pub fn retry_base_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry.base_delay_ms = ms;
        self
    }

    pub fn retry_max_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry.max_delay_ms = ms;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
