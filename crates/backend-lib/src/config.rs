// ============================
// crates/backend-lib/src/config.rs
// ============================
//! Configuration management.
use crate::error::AppError;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const MAX_LIKE_RETRIES: u32 = 10;

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Log level
    pub log_level: String,
    pub storage: StorageSettings,
    pub readiness: ReadinessSettings,
    pub likes: LikeSettings,
    pub heartbeat: HeartbeatSettings,
    pub limits: LimitSettings,
}

/// Which durable store backs the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    File,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StoreBackend,
    /// Data directory for the flat-file store
    pub path: PathBuf,
    /// Treat sessions as durable the moment they register
    pub bypass_readiness: bool,
}

/// How long dependent writes wait for a session's durable row
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessSettings {
    pub track_timeout_ms: u64,
    pub poll_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LikeSettings {
    /// Lookups after the first one before a like is dropped
    pub max_retries: u32,
    /// First retry delay; doubles on each further retry
    pub base_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub max_message_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3001)),
            log_level: "info".to_string(),
            storage: StorageSettings::default(),
            readiness: ReadinessSettings::default(),
            likes: LikeSettings::default(),
            heartbeat: HeartbeatSettings::default(),
            limits: LimitSettings::default(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::File,
            path: PathBuf::from("data"),
            bypass_readiness: false,
        }
    }
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            track_timeout_ms: 4000,
            poll_timeout_ms: 3000,
        }
    }
}

impl Default for LikeSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 100,
        }
    }
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self { interval_secs: 10 }
    }
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_message_bytes: 16 * 1024,
        }
    }
}

impl ReadinessSettings {
    pub fn track_timeout(&self) -> Duration {
        Duration::from_millis(self.track_timeout_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl Settings {
    /// Load settings from `pika.toml` and `PIKA_` environment variables
    pub fn load() -> Result<Self, AppError> {
        Self::load_from("pika.toml")
    }

    /// Load settings from an explicit TOML file, then environment overrides
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PIKA_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<(), AppError> {
        if !LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(AppError::Config(format!(
                "unknown log level '{}'",
                self.log_level
            )));
        }
        if self.readiness.track_timeout_ms == 0 || self.readiness.poll_timeout_ms == 0 {
            return Err(AppError::Config(
                "readiness timeouts must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat.interval_secs == 0 {
            return Err(AppError::Config(
                "heartbeat interval must be greater than zero".to_string(),
            ));
        }
        if self.likes.base_backoff_ms == 0 {
            return Err(AppError::Config(
                "likes.base_backoff_ms must be greater than zero".to_string(),
            ));
        }
        if self.likes.max_retries > MAX_LIKE_RETRIES {
            return Err(AppError::Config(format!(
                "likes.max_retries cannot exceed {MAX_LIKE_RETRIES}"
            )));
        }
        if self.limits.max_message_bytes == 0 {
            return Err(AppError::Config(
                "limits.max_message_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
