//! Configuration loading for the fleet sync core.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `FLEETSYNC_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_PREFIX: &str = "FLEETSYNC_";

/// Application configuration derived from `FLEETSYNC_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Scheduler-specific configuration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SchedulerConfig {
    /// Start the scheduler clock in `serve` (default: true)
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,

    /// Advisory lock file guarding single clock ownership
    ///
    /// Environment variable: `FLEETSYNC_SCHEDULER_LOCK_PATH`
    #[serde(default = "default_scheduler_lock_path")]
    pub lock_path: PathBuf,

    /// IANA timezone all triggers are evaluated in (default: UTC)
    #[serde(default = "default_scheduler_timezone")]
    pub timezone: String,

    #[serde(default = "default_scheduler_tick_interval_seconds")]
    pub tick_interval_seconds: u64,

    /// Size of the bounded firing pool
    #[serde(default = "default_scheduler_worker_pool_size")]
    pub worker_pool_size: usize,

    #[serde(default = "default_scheduler_misfire_grace_seconds")]
    pub default_misfire_grace_seconds: u64,

    /// Optional TOML file with declarative job definitions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jobs_file: Option<PathBuf>,
}

/// Collection pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SyncConfig {
    /// Per adapter step timeout in seconds; 0 disables the timeout
    ///
    /// Environment variable: `FLEETSYNC_SYNC_STEP_TIMEOUT_SECONDS`
    #[serde(default = "default_sync_step_timeout_seconds")]
    pub step_timeout_seconds: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            scheduler: SchedulerConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            lock_path: default_scheduler_lock_path(),
            timezone: default_scheduler_timezone(),
            tick_interval_seconds: default_scheduler_tick_interval_seconds(),
            worker_pool_size: default_scheduler_worker_pool_size(),
            default_misfire_grace_seconds: default_scheduler_misfire_grace_seconds(),
            jobs_file: None,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            step_timeout_seconds: default_sync_step_timeout_seconds(),
        }
    }
}

impl SchedulerConfig {
    /// Validate scheduler configuration bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_seconds == 0 || self.tick_interval_seconds > 60 {
            return Err(ConfigError::InvalidSchedulerTickInterval {
                value: self.tick_interval_seconds,
            });
        }

        if self.worker_pool_size == 0 || self.worker_pool_size > 64 {
            return Err(ConfigError::InvalidSchedulerWorkerPoolSize {
                value: self.worker_pool_size,
            });
        }

        if self.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(ConfigError::InvalidSchedulerTimezone {
                value: self.timezone.clone(),
            });
        }

        if self.lock_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingSchedulerLockPath);
        }

        Ok(())
    }

    /// Parsed scheduler timezone, falling back to UTC for invalid names.
    pub fn tz(&self) -> chrono_tz::Tz {
        self.timezone.parse().unwrap_or(chrono_tz::UTC)
    }
}

impl AppConfig {
    /// Returns a redacted JSON representation (database credentials are hidden).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        config.database_url = redact_database_url(&config.database_url);
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning the first out-of-range value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }

        if self.db_max_connections == 0 {
            return Err(ConfigError::InvalidDbMaxConnections {
                value: self.db_max_connections,
            });
        }

        self.scheduler.validate()?;

        Ok(())
    }
}

/// Replaces the password component of a connection URL with `[REDACTED]`.
fn redact_database_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((userinfo, host)) = rest.split_once('@') else {
        return url.to_string();
    };
    match userinfo.split_once(':') {
        Some((user, _)) => format!("{scheme}://{user}:[REDACTED]@{host}"),
        None => url.to_string(),
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://fleetsync.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_scheduler_enabled() -> bool {
    true
}

fn default_scheduler_lock_path() -> PathBuf {
    env::temp_dir().join("fleetsync_scheduler.lock")
}

fn default_scheduler_timezone() -> String {
    "UTC".to_string()
}

fn default_scheduler_tick_interval_seconds() -> u64 {
    1
}

fn default_scheduler_worker_pool_size() -> usize {
    4
}

fn default_scheduler_misfire_grace_seconds() -> u64 {
    300
}

fn default_sync_step_timeout_seconds() -> u64 {
    120
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error("database max connections must be positive, got {value}")]
    InvalidDbMaxConnections { value: u32 },
    #[error("scheduler tick interval must be between 1 and 60 seconds, got {value}")]
    InvalidSchedulerTickInterval { value: u64 },
    #[error("scheduler worker pool size must be between 1 and 64, got {value}")]
    InvalidSchedulerWorkerPoolSize { value: usize },
    #[error("scheduler timezone '{value}' is not a known IANA timezone")]
    InvalidSchedulerTimezone { value: String },
    #[error("scheduler lock path is empty; set FLEETSYNC_SCHEDULER_LOCK_PATH")]
    MissingSchedulerLockPath,
}

/// Loads configuration using layered `.env` files and `FLEETSYNC_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads `.env` layers, overlays the process environment and validates.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = take_string(&mut layered, "PROFILE").unwrap_or(profile_hint);
        let log_level = take_string(&mut layered, "LOG_LEVEL").unwrap_or_else(default_log_level);
        let log_format =
            take_string(&mut layered, "LOG_FORMAT").unwrap_or_else(default_log_format);
        let database_url =
            take_string(&mut layered, "DATABASE_URL").unwrap_or_else(default_database_url);
        let db_max_connections = take_parsed(&mut layered, "DB_MAX_CONNECTIONS")?
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = take_parsed(&mut layered, "DB_ACQUIRE_TIMEOUT_MS")?
            .unwrap_or_else(default_db_acquire_timeout_ms);

        let scheduler = SchedulerConfig {
            enabled: take_bool(&mut layered, "SCHEDULER_ENABLED")?
                .unwrap_or_else(default_scheduler_enabled),
            lock_path: take_string(&mut layered, "SCHEDULER_LOCK_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(default_scheduler_lock_path),
            timezone: take_string(&mut layered, "SCHEDULER_TIMEZONE")
                .unwrap_or_else(default_scheduler_timezone),
            tick_interval_seconds: take_parsed(&mut layered, "SCHEDULER_TICK_INTERVAL_SECONDS")?
                .unwrap_or_else(default_scheduler_tick_interval_seconds),
            worker_pool_size: take_parsed(&mut layered, "SCHEDULER_WORKER_POOL_SIZE")?
                .unwrap_or_else(default_scheduler_worker_pool_size),
            default_misfire_grace_seconds: take_parsed(
                &mut layered,
                "SCHEDULER_DEFAULT_MISFIRE_GRACE_SECONDS",
            )?
            .unwrap_or_else(default_scheduler_misfire_grace_seconds),
            jobs_file: take_string(&mut layered, "SCHEDULER_JOBS_FILE").map(|path| {
                let path = PathBuf::from(path);
                if path.is_relative() {
                    self.base_dir.join(path)
                } else {
                    path
                }
            }),
        };

        let sync = SyncConfig {
            step_timeout_seconds: take_parsed(&mut layered, "SYNC_STEP_TIMEOUT_SECONDS")?
                .unwrap_or_else(default_sync_step_timeout_seconds),
        };

        let config = AppConfig {
            profile,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            scheduler,
            sync,
        };

        config.validate()?;
        Ok(config)
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn take_string(layered: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    layered.remove(key).filter(|v| !v.trim().is_empty())
}

fn take_parsed<T: std::str::FromStr>(
    layered: &mut BTreeMap<String, String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match take_string(layered, key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}{key}"),
                value: raw,
            }),
        None => Ok(None),
    }
}

fn take_bool(layered: &mut BTreeMap<String, String>, key: &str) -> Result<Option<bool>, ConfigError> {
    match take_string(layered, key) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}{key}"),
                value: raw,
            }),
        },
        None => Ok(None),
    }
}
