//! Layered configuration: defaults → file → environment → code overrides.
//! See `spec.md` §4.C.
mod env;
mod reload;

pub use env::apply_env_overrides;
pub use reload::{ConfigWatcher, ReloadEvent};

use crate::level::Level;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

static SINK_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_-]*$").unwrap());

/// Standard filename searched for in the working directory when no explicit
/// path is given to [`ConfigDocument::load`]. See `spec.md` §4.C / §6.
const STANDARD_CONFIG_FILENAME: &str = "logging.config.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config at `{field}`: {message}")]
    Validation { field: String, message: String },
}

impl crate::error::ErrorClassification for ConfigError {
    fn is_retryable(&self) -> bool {
        false
    }
}

/// Top-level configuration document. Mirrors the shape a deployment would
/// hand in as JSON, with every field defaulted so a bare `{}` document is
/// valid.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigDocument {
    pub level: String,
    pub service: String,
    pub environment: String,
    pub sampling: SamplingConfig,
    pub batch: BatchConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub shutdown: ShutdownConfig,
    pub sinks: SinksConfig,
    pub metrics: MetricsConfig,
}

impl Default for ConfigDocument {
    fn default() -> Self {
        ConfigDocument {
            level: "info".to_owned(),
            service: "unknown-service".to_owned(),
            environment: "development".to_owned(),
            sampling: SamplingConfig::default(),
            batch: BatchConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            shutdown: ShutdownConfig::default(),
            sinks: SinksConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Fraction in [0, 1] of debug/info records kept; warn/error/fatal are
    /// never sampled away. See `spec.md` §4.H.
    pub debug_info_rate: f64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        SamplingConfig { debug_info_rate: 1.0 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_size: usize,
    pub max_queue_size: usize,
    pub timeout_ms: u64,
    pub max_concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            max_size: 500,
            max_queue_size: 10_000,
            timeout_ms: 1_000,
            max_concurrency: 4,
        }
    }
}

impl BatchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 5,
            initial_delay_ms: 200,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_ms: u64,
    pub half_open_max_probes: u32,
    pub window_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 5,
            reset_ms: 30_000,
            half_open_max_probes: 1,
            window_ms: 60_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub shutdown_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        ShutdownConfig { shutdown_timeout_ms: 5_000 }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_addr: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SinksConfig {
    pub console: Option<ConsoleSinkConfig>,
    pub file: Option<FileSinkConfig>,
    pub otlp: Option<OtlpSinkConfig>,
    pub redis: Option<RedisSinkConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleSinkConfig {
    pub pretty: bool,
    /// Whether the pretty form may use ANSI color codes at all. Actual
    /// colorization also requires the target stream to be a TTY — see
    /// `sink::console`. See `spec.md` §4.G "configurable off for non-TTY".
    pub colorize: bool,
    /// Per-sink minimum level; records below it are gated before reaching
    /// this sink even if the global logger level would admit them. `None`
    /// means "no sink-specific floor, use the global level only". See
    /// `spec.md` §4.I.
    pub level: Option<String>,
}

impl Default for ConsoleSinkConfig {
    fn default() -> Self {
        ConsoleSinkConfig { pretty: true, colorize: true, level: None }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSinkConfig {
    pub path: String,
    pub max_size_bytes: u64,
    pub rotation_interval: Option<String>,
    pub retention_days: u32,
    /// Count-based retention cap, applied alongside `retention_days`: once
    /// more than this many rotated files exist, the oldest are deleted
    /// regardless of age. `None` disables the count cap. See `spec.md` §4.C
    /// `maxFiles`.
    pub max_files: Option<u32>,
    pub compress: bool,
    pub level: Option<String>,
}

impl Default for FileSinkConfig {
    fn default() -> Self {
        FileSinkConfig {
            path: "logs/app.log".to_owned(),
            max_size_bytes: 100 * 1024 * 1024,
            rotation_interval: None,
            retention_days: 14,
            max_files: Some(5),
            compress: true,
            level: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OtlpSinkConfig {
    pub endpoint: String,
    pub headers: Vec<(String, String)>,
    pub timeout_ms: u64,
    pub gzip: bool,
    pub level: Option<String>,
}

impl Default for OtlpSinkConfig {
    fn default() -> Self {
        OtlpSinkConfig {
            endpoint: String::new(),
            headers: Vec::new(),
            timeout_ms: 5_000,
            gzip: true,
            level: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSinkConfig {
    /// Connection string; carries host/port/password/database/TLS scheme in
    /// one place rather than as separate `host`/`port`/`password`/`database`
    /// fields — the `redis` crate's native URL form, see `spec.md` §4.C.
    pub url: String,
    pub mode: RedisMode,
    pub key: String,
    pub max_list_len: Option<usize>,
    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
    /// Cap on reconnect attempts after the initial connection fails, each
    /// separated by exponential backoff. `0` (the default) means no retry:
    /// the first failure is returned immediately so the circuit breaker and
    /// Retry Manager see it, per the sinks' fail-fast contract.
    pub max_retries: u32,
    pub level: Option<String>,
}

impl Default for RedisSinkConfig {
    fn default() -> Self {
        RedisSinkConfig {
            url: "redis://127.0.0.1:6379".to_owned(),
            mode: RedisMode::List,
            key: "logs".to_owned(),
            max_list_len: Some(100_000),
            connect_timeout_ms: 5_000,
            command_timeout_ms: 2_000,
            max_retries: 0,
            level: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedisMode {
    List,
    Stream,
    Pubsub,
}

impl ConfigDocument {
    /// Loads configuration from an optional file path, falling back to
    /// [`STANDARD_CONFIG_FILENAME`] in the working directory when no path is
    /// given and that file exists, then layers the process environment on
    /// top (`LOGFLOW_*` variables, see [`env::apply_env_overrides`]), then
    /// validates the merged result.
    pub fn load(file_path: Option<&Path>) -> Result<ConfigDocument, ConfigError> {
        let mut doc = match file_path {
            Some(path) => Self::read_from(path)?,
            None => {
                let standard = Path::new(STANDARD_CONFIG_FILENAME);
                if standard.exists() {
                    Self::read_from(standard)?
                } else {
                    ConfigDocument::default()
                }
            }
        };
        apply_env_overrides(&mut doc)?;
        doc.validate()?;
        Ok(doc)
    }

    fn read_from(path: &Path) -> Result<ConfigDocument, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        Level::from_str(&self.level).map_err(|e| ConfigError::Validation {
            field: "level".to_owned(),
            message: e.to_string(),
        })?;

        if self.service.trim().is_empty() {
            return Err(ConfigError::Validation {
                field: "service".to_owned(),
                message: "must not be empty".to_owned(),
            });
        }
        if self.environment.trim().is_empty() {
            return Err(ConfigError::Validation {
                field: "environment".to_owned(),
                message: "must not be empty".to_owned(),
            });
        }

        if !(0.0..=1.0).contains(&self.sampling.debug_info_rate) {
            return Err(ConfigError::Validation {
                field: "sampling.debug_info_rate".to_owned(),
                message: "must be between 0 and 1".to_owned(),
            });
        }

        if self.batch.max_size == 0 {
            return Err(ConfigError::Validation {
                field: "batch.max_size".to_owned(),
                message: "must be greater than zero".to_owned(),
            });
        }
        if self.batch.max_queue_size < self.batch.max_size {
            return Err(ConfigError::Validation {
                field: "batch.max_queue_size".to_owned(),
                message: "must be >= batch.max_size".to_owned(),
            });
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Validation {
                field: "retry.max_attempts".to_owned(),
                message: "must be greater than zero".to_owned(),
            });
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::Validation {
                field: "retry.multiplier".to_owned(),
                message: "must be >= 1.0".to_owned(),
            });
        }

        if let Some(file) = &self.sinks.file {
            if file.path.trim().is_empty() {
                return Err(ConfigError::Validation {
                    field: "sinks.file.path".to_owned(),
                    message: "must not be empty when the file sink is configured".to_owned(),
                });
            }
        }

        if let Some(otlp) = &self.sinks.otlp {
            if otlp.endpoint.is_empty() {
                return Err(ConfigError::Validation {
                    field: "sinks.otlp.endpoint".to_owned(),
                    message: "must not be empty when the otlp sink is configured".to_owned(),
                });
            }
            url::Url::parse(&otlp.endpoint).map_err(|e| ConfigError::Validation {
                field: "sinks.otlp.endpoint".to_owned(),
                message: e.to_string(),
            })?;
        }

        if let Some(redis) = &self.sinks.redis {
            if !SINK_NAME_RE.is_match(&redis.key) {
                return Err(ConfigError::Validation {
                    field: "sinks.redis.key".to_owned(),
                    message: "must match ^[a-zA-Z][a-zA-Z0-9_-]*$".to_owned(),
                });
            }
        }

        let per_sink_levels = [
            ("sinks.console.level", self.sinks.console.as_ref().and_then(|c| c.level.as_deref())),
            ("sinks.file.level", self.sinks.file.as_ref().and_then(|c| c.level.as_deref())),
            ("sinks.otlp.level", self.sinks.otlp.as_ref().and_then(|c| c.level.as_deref())),
            ("sinks.redis.level", self.sinks.redis.as_ref().and_then(|c| c.level.as_deref())),
        ];
        for (field, value) in per_sink_levels {
            if let Some(value) = value {
                Level::from_str(value).map_err(|e| ConfigError::Validation {
                    field: field.to_owned(),
                    message: e.to_string(),
                })?;
            }
        }

        Ok(())
    }

    pub fn level(&self) -> Level {
        Level::from_str(&self.level).unwrap_or(Level::Info)
    }

    /// `true` if `other` changes any field a hot reload cannot apply
    /// in-place: service/environment identity, or an endpoint/host a sink
    /// connects to. A `critical-changes` event fires for these so the
    /// pipeline knows the affected sinks must be closed and reinstantiated
    /// rather than left running against stale config. See `spec.md` §4.C.
    pub fn critical_fields_changed(&self, other: &ConfigDocument) -> bool {
        self.service != other.service
            || self.environment != other.environment
            || self.sinks.otlp.as_ref().map(|c| &c.endpoint) != other.sinks.otlp.as_ref().map(|c| &c.endpoint)
            || self.sinks.redis.as_ref().map(|c| &c.url) != other.sinks.redis.as_ref().map(|c| &c.url)
            || self.sinks.file.as_ref().map(|c| &c.path) != other.sinks.file.as_ref().map(|c| &c.path)
    }
}
