//! Operator-wide settings.
//!
//! [`Config::load`] starts from [`Config::default`], overlays an optional JSON
//! file, then `JWKS_OPERATOR_*` environment variables, and validates the
//! result. Durations are written the humantime way (`"5m"`, `"6h"`,
//! `"720h"`).
//!
//! ```no_run
//! use jwks_operator::Config;
//! use std::path::Path;
//!
//! let config = Config::load(Some(Path::new("/etc/jwks-operator/config.json")), "auth")?;
//! assert_eq!(config.namespace, "auth");
//! # Ok::<(), jwks_operator::ConfigError>(())
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "JWKS_OPERATOR_";

const VALID_LOG_LEVELS: [&str; 4] = ["debug", "info", "warn", "error"];

/// Errors from loading or validating [`Config`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The config file exists but could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path of the config file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for [`Config`].
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    /// A setting has an unusable value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Operator-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Namespace the operator runs in. Supplied by the environment, never by
    /// the file.
    #[serde(skip)]
    pub namespace: String,

    /// Steady-state interval between passes.
    #[serde(with = "humantime_serde")]
    pub reconcile_interval: Duration,

    /// Interval after which a target's key set is regenerated.
    #[serde(rename = "jwksUpdateInterval", with = "humantime_serde")]
    pub jwks_update_interval: Duration,

    /// Interval after which the served key set is verified again.
    #[serde(rename = "jwksVerificationInterval", with = "humantime_serde")]
    pub jwks_verification_interval: Duration,

    /// Upper bound on retained old keys. Validated, not enforced.
    pub max_old_keys: u32,

    /// Default retention of old keys. Validated, not enforced.
    #[serde(rename = "defaultOldKeysTTL", with = "humantime_serde")]
    pub default_old_keys_ttl: Duration,

    /// `rolling` or `immediate`, used when a target does not choose.
    pub default_update_strategy: String,

    /// Whether old keys are kept when a target does not choose.
    pub default_keep_old_keys: bool,

    /// Whether deleting a target also deletes its storage objects.
    pub cleanup_on_delete: bool,

    /// Logging settings.
    pub logging: LoggingConfig,

    /// Metrics exposition settings.
    pub metrics: MetricsConfig,

    /// Backoff applied by the controller after a failed pass.
    pub retry: RetryConfig,

    /// Serving workload settings.
    pub nginx: NginxConfig,

    /// Verification engine settings.
    pub verification: VerificationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            reconcile_interval: Duration::from_secs(5 * 60),
            jwks_update_interval: Duration::from_secs(6 * 60 * 60),
            jwks_verification_interval: Duration::from_secs(60),
            max_old_keys: 3,
            default_old_keys_ttl: Duration::from_secs(720 * 60 * 60),
            default_update_strategy: "rolling".to_string(),
            default_keep_old_keys: true,
            cleanup_on_delete: false,
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            retry: RetryConfig::default(),
            nginx: NginxConfig::default(),
            verification: VerificationConfig::default(),
        }
    }
}

/// Logging settings, consumed by the embedding binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    /// One of `debug`, `info`, `warn`, `error`.
    pub level: String,
    /// `json` or `console`.
    pub format: String,
    /// Whether per-phase progress is worth surfacing.
    pub verbose_reconcile: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
            verbose_reconcile: false,
        }
    }
}

#[cfg(feature = "logging")]
impl LoggingConfig {
    /// Maps [`LoggingConfig::level`] onto a `log` filter.
    ///
    /// Unknown levels map to `Info`; [`Config::validate`] rejects them anyway.
    pub fn level_filter(&self) -> log::LevelFilter {
        match self.level.to_ascii_lowercase().as_str() {
            "debug" => log::LevelFilter::Debug,
            "warn" => log::LevelFilter::Warn,
            "error" => log::LevelFilter::Error,
            _ => log::LevelFilter::Info,
        }
    }
}

/// Metrics exposition settings, consumed by the embedding binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsConfig {
    /// Listen port.
    pub port: u16,
    /// Scrape path.
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            path: "/metrics".to_string(),
        }
    }
}

/// Exponential backoff after a failed pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Failures after which the backoff stops growing.
    pub max_attempts: u32,
    /// Delay after the first failure.
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Growth factor per consecutive failure.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(5 * 60),
            backoff_multiplier: 2.0,
        }
    }
}

/// Serving workload settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NginxConfig {
    /// Image of the serving container.
    pub image: String,
    /// Port the serving process listens on.
    pub port: u16,
    /// Number of serving instances.
    pub replicas: i32,
    /// `max-age` of the `Cache-Control` header, in seconds.
    pub cache_max_age: u32,
    /// Compute requests and limits of the serving container.
    pub resources: NginxResources,
}

impl Default for NginxConfig {
    fn default() -> Self {
        Self {
            image: "nginx:1.25-alpine".to_string(),
            port: 80,
            replicas: 1,
            cache_max_age: 3600,
            resources: NginxResources::default(),
        }
    }
}

/// Requests and limits of the serving container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NginxResources {
    /// Guaranteed amounts.
    pub requests: ResourceQuantities,
    /// Upper bounds.
    pub limits: ResourceQuantities,
}

impl Default for NginxResources {
    fn default() -> Self {
        Self {
            requests: ResourceQuantities {
                cpu: "50m".to_string(),
                memory: "64Mi".to_string(),
            },
            limits: ResourceQuantities {
                cpu: "200m".to_string(),
                memory: "128Mi".to_string(),
            },
        }
    }
}

/// CPU and memory quantities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceQuantities {
    /// CPU quantity, e.g. `50m`.
    pub cpu: String,
    /// Memory quantity, e.g. `64Mi`.
    pub memory: String,
}

/// Verification engine settings.
///
/// A zero value falls back to the corresponding default at use time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VerificationConfig {
    /// Timeout of one HTTP fetch.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Attempts of the fetch-and-verify sequence.
    pub retry_count: u32,
    /// Delay between attempts.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Bound on all attempts together.
    #[serde(with = "humantime_serde")]
    pub context_timeout: Duration,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retry_count: 3,
            retry_delay: Duration::from_secs(2),
            context_timeout: Duration::from_secs(30),
        }
    }
}

impl VerificationConfig {
    /// Effective fetch timeout.
    pub fn effective_timeout(&self) -> Duration {
        non_zero_or(self.timeout, Self::default().timeout)
    }

    /// Effective attempt count.
    pub fn effective_retry_count(&self) -> u32 {
        if self.retry_count == 0 {
            Self::default().retry_count
        } else {
            self.retry_count
        }
    }

    /// Effective delay between attempts.
    pub fn effective_retry_delay(&self) -> Duration {
        non_zero_or(self.retry_delay, Self::default().retry_delay)
    }

    /// Effective bound on all attempts together.
    pub fn effective_context_timeout(&self) -> Duration {
        non_zero_or(self.context_timeout, Self::default().context_timeout)
    }
}

fn non_zero_or(value: Duration, default: Duration) -> Duration {
    if value.is_zero() {
        default
    } else {
        value
    }
}

impl Config {
    /// Loads settings for an operator running in `namespace`.
    ///
    /// A missing file is not an error; the defaults apply.
    ///
    /// # Errors
    /// - [`ConfigError::Read`] if the file exists but cannot be read.
    /// - [`ConfigError::Parse`] if the file is not valid JSON.
    /// - [`ConfigError::Invalid`] if validation fails.
    pub fn load(path: Option<&Path>, namespace: &str) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => match std::fs::read(path) {
                Ok(bytes) => Self::from_json(&bytes)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
                Err(source) => {
                    return Err(ConfigError::Read {
                        path: path.to_path_buf(),
                        source,
                    })
                }
            },
            None => Self::default(),
        };

        config.namespace = namespace.to_string();
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parses settings from JSON. Absent keys keep their defaults.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ConfigError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Applies `JWKS_OPERATOR_*` overrides read through `lookup`.
    ///
    /// Unparseable or zero durations and non-numeric ports are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(&format!("{ENV_PREFIX}{key}")).filter(|value| !value.is_empty())
        };
        let duration = |key: &str| {
            get(key)
                .and_then(|value| humantime::parse_duration(value.trim()).ok())
                .filter(|d| !d.is_zero())
        };

        if let Some(d) = duration("RECONCILE_INTERVAL") {
            self.reconcile_interval = d;
        }
        if let Some(d) = duration("JWKS_UPDATE_INTERVAL") {
            self.jwks_update_interval = d;
        }
        if let Some(level) = get("LOGGING_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = get("LOGGING_FORMAT") {
            self.logging.format = format;
        }
        if let Some(port) = get("METRICS_PORT").and_then(|p| p.trim().parse().ok()) {
            self.metrics.port = port;
        }
        if let Some(path) = get("METRICS_PATH") {
            self.metrics.path = path;
        }
    }

    /// Checks every setting the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.namespace.is_empty() {
            return invalid("namespace is required and must be provided by the environment");
        }
        if self.reconcile_interval.is_zero() {
            return invalid("reconcileInterval must be positive");
        }
        if self.jwks_update_interval.is_zero() {
            return invalid("jwksUpdateInterval must be positive");
        }
        if self.default_old_keys_ttl.is_zero() {
            return invalid("defaultOldKeysTTL must be positive");
        }
        if self.default_update_strategy.parse::<crate::jwks::UpdateStrategy>().is_err() {
            return invalid("defaultUpdateStrategy must be 'rolling' or 'immediate'");
        }
        let level = self.logging.level.to_ascii_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return invalid("logging level must be one of: debug, info, warn, error");
        }
        if self.nginx.port == 0 {
            return invalid("nginx port must be between 1 and 65535");
        }
        if self.nginx.replicas < 0 {
            return invalid("nginx replicas must be non-negative");
        }
        let resources = &self.nginx.resources;
        for (name, value) in [
            ("requests.cpu", &resources.requests.cpu),
            ("requests.memory", &resources.requests.memory),
            ("limits.cpu", &resources.limits.cpu),
            ("limits.memory", &resources.limits.memory),
        ] {
            if value.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "nginx resources {name} must not be empty"
                )));
            }
        }
        if self.retry.backoff_multiplier < 1.0 {
            return invalid("retry backoffMultiplier must be at least 1.0");
        }
        Ok(())
    }
}
