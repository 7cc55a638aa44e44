//! Driver configuration from environment variables or a TOML document.
//!
//! Every value has a default. Invalid environment values fall back to the
//! default without failing; out-of-range values are clamped.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `DOCDB_MAX_POOL_SIZE` | 100 | Pool slots per server |
//! | `DOCDB_MIN_POOL_SIZE` | 0 | Connections kept open by maintenance |
//! | `DOCDB_WAIT_QUEUE_SIZE` | 500 | Concurrent checkout waiters |
//! | `DOCDB_WAIT_QUEUE_TIMEOUT_MS` | 120000 | Checkout budget (ms) |
//! | `DOCDB_MAINTENANCE_INTERVAL_MS` | 60000 | Maintenance period (ms, 0 = off) |
//! | `DOCDB_MAX_CONNECTING` | 2 | Concurrent connection establishments |
//! | `DOCDB_LOAD_BALANCED` | false | Backends sit behind a load balancer |
//! | `DOCDB_MAX_IDLE_TIME_MS` | 0 | Idle expiry (ms, 0 = off) |
//! | `DOCDB_MAX_LIFE_TIME_MS` | 0 | Lifetime expiry (ms, 0 = off) |
//! | `DOCDB_LOGICAL_SESSION_TIMEOUT_SECS` | 1800 | Session timeout fallback (secs) |
//! | `DOCDB_LOG_FORMAT` | json | `json` or `pretty` |
//! | `DOCDB_LOG_LEVEL` | info | `EnvFilter` directive |
//! | `DOCDB_LOG_FILE` | unset | Log file path |

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionSettings;
use crate::error::DriverError;
use crate::pool::ConnectionPoolSettings;
use crate::session::SessionPoolSettings;
use crate::telemetry::{LogConfig, LogFormat};

const DEFAULT_MAX_POOL_SIZE: usize = 100;
const DEFAULT_WAIT_QUEUE_SIZE: usize = 500;
const DEFAULT_WAIT_QUEUE_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_MAINTENANCE_INTERVAL_MS: u64 = 60_000;
const DEFAULT_MAX_CONNECTING: usize = 2;
const DEFAULT_LOGICAL_SESSION_TIMEOUT_SECS: u64 = 30 * 60;

/// Effective configuration summary (serializable).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveConfig {
    pub max_pool_size: usize,
    pub min_pool_size: usize,
    pub wait_queue_size: usize,
    pub wait_queue_timeout_ms: u64,
    pub maintenance_interval_ms: Option<u64>,
    pub max_connecting: usize,
    pub load_balanced: bool,
    pub max_idle_time_ms: Option<u64>,
    pub max_life_time_ms: Option<u64>,
    pub logical_session_timeout_secs: Option<u64>,
    pub log_format: String,
    pub log_level: String,
}

/// All driver configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvConfig {
    pub pool: ConnectionPoolSettings,
    pub connection: ConnectionSettings,
    pub session_pool: SessionPoolSettings,
    pub logging: LogConfig,
}

/// Unvalidated values, from either source.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    max_pool_size: Option<usize>,
    min_pool_size: Option<usize>,
    wait_queue_size: Option<usize>,
    wait_queue_timeout_ms: Option<u64>,
    maintenance_interval_ms: Option<u64>,
    max_connecting: Option<usize>,
    load_balanced: Option<bool>,
    max_idle_time_ms: Option<u64>,
    max_life_time_ms: Option<u64>,
    logical_session_timeout_secs: Option<u64>,
    logging: RawLogging,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawLogging {
    format: Option<String>,
    level: Option<String>,
    file: Option<PathBuf>,
}

/// Parse an env var, `None` on missing or invalid.
fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse::<T>().ok()
}

/// Zero disables an optional interval.
fn optional_millis(value: Option<u64>, default: Option<u64>) -> Option<Duration> {
    match value.or(default) {
        Some(0) | None => None,
        Some(ms) => Some(Duration::from_millis(ms)),
    }
}

impl RawConfig {
    fn from_env() -> Self {
        Self {
            max_pool_size: parse_env("DOCDB_MAX_POOL_SIZE"),
            min_pool_size: parse_env("DOCDB_MIN_POOL_SIZE"),
            wait_queue_size: parse_env("DOCDB_WAIT_QUEUE_SIZE"),
            wait_queue_timeout_ms: parse_env("DOCDB_WAIT_QUEUE_TIMEOUT_MS"),
            maintenance_interval_ms: parse_env("DOCDB_MAINTENANCE_INTERVAL_MS"),
            max_connecting: parse_env("DOCDB_MAX_CONNECTING"),
            load_balanced: parse_env("DOCDB_LOAD_BALANCED"),
            max_idle_time_ms: parse_env("DOCDB_MAX_IDLE_TIME_MS"),
            max_life_time_ms: parse_env("DOCDB_MAX_LIFE_TIME_MS"),
            logical_session_timeout_secs: parse_env("DOCDB_LOGICAL_SESSION_TIMEOUT_SECS"),
            logging: RawLogging::default(),
        }
    }

    /// Apply defaults, floors and clamps.
    fn resolve(self, logging: LogConfig) -> EnvConfig {
        let max_connections = self.max_pool_size.unwrap_or(DEFAULT_MAX_POOL_SIZE).max(1);
        let min_connections = self.min_pool_size.unwrap_or(0).min(max_connections);
        let wait_queue_size = self.wait_queue_size.unwrap_or(DEFAULT_WAIT_QUEUE_SIZE).max(1);
        let wait_queue_timeout_ms = self
            .wait_queue_timeout_ms
            .unwrap_or(DEFAULT_WAIT_QUEUE_TIMEOUT_MS)
            .max(1);
        let max_connecting = self
            .max_connecting
            .unwrap_or(DEFAULT_MAX_CONNECTING)
            .clamp(1, max_connections);
        let session_timeout_secs = self
            .logical_session_timeout_secs
            .unwrap_or(DEFAULT_LOGICAL_SESSION_TIMEOUT_SECS)
            .max(1);

        EnvConfig {
            pool: ConnectionPoolSettings {
                max_connections,
                min_connections,
                wait_queue_size,
                wait_queue_timeout: Duration::from_millis(wait_queue_timeout_ms),
                maintenance_interval: optional_millis(
                    self.maintenance_interval_ms,
                    Some(DEFAULT_MAINTENANCE_INTERVAL_MS),
                ),
                max_connecting,
                load_balanced: self.load_balanced.unwrap_or(false),
            },
            connection: ConnectionSettings {
                max_idle_time: optional_millis(self.max_idle_time_ms, None),
                max_life_time: optional_millis(self.max_life_time_ms, None),
            },
            session_pool: SessionPoolSettings {
                logical_session_timeout: Some(Duration::from_secs(session_timeout_secs)),
            },
            logging,
        }
    }
}

/// Load configuration from environment variables.
///
/// Missing or invalid values fall back to safe defaults without panicking.
pub fn load() -> EnvConfig {
    RawConfig::from_env().resolve(LogConfig::from_env())
}

/// Parse the same settings from a TOML document. Keys match the
/// environment variable names without the `DOCDB_` prefix, in lower case;
/// logging lives under `[logging]`.
pub fn from_toml_str(document: &str) -> Result<EnvConfig, DriverError> {
    let mut raw: RawConfig =
        toml::from_str(document).map_err(|e| DriverError::InvalidSettings(e.to_string()))?;

    let raw_logging = std::mem::take(&mut raw.logging);
    let mut logging = LogConfig::default();
    if let Some(format) = raw_logging.format {
        logging.format = LogFormat::parse(&format)
            .ok_or_else(|| DriverError::InvalidSettings(format!("unknown log format '{format}'")))?;
    }
    if let Some(level) = raw_logging.level {
        logging.level = level;
    }
    logging.output_path = raw_logging.file;

    Ok(raw.resolve(logging))
}

impl EnvConfig {
    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        let millis = |d: Duration| d.as_millis() as u64;
        EffectiveConfig {
            max_pool_size: self.pool.max_connections,
            min_pool_size: self.pool.min_connections,
            wait_queue_size: self.pool.wait_queue_size,
            wait_queue_timeout_ms: millis(self.pool.wait_queue_timeout),
            maintenance_interval_ms: self.pool.maintenance_interval.map(millis),
            max_connecting: self.pool.max_connecting,
            load_balanced: self.pool.load_balanced,
            max_idle_time_ms: self.connection.max_idle_time.map(millis),
            max_life_time_ms: self.connection.max_life_time.map(millis),
            logical_session_timeout_secs: self.session_pool.logical_session_timeout.map(|d| d.as_secs()),
            log_format: match self.logging.format {
                LogFormat::Json => "json".into(),
                LogFormat::Pretty => "pretty".into(),
            },
            log_level: self.logging.level.clone(),
        }
    }
}
