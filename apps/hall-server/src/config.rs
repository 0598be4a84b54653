//! Hall server configuration.
//!
//! Loaded from a TOML file, then overridden by `CUE_*` environment
//! variables. Every field has a default, so an empty file (or none at all)
//! starts a working development server.
//!
//! ```toml
//! log_level = "info,hall_server=debug"
//!
//! [server]
//! bind_addr = "0.0.0.0"
//! port = 8080
//! action_timeout_ms = 5000
//!
//! [venue]
//! name = "Corner Pocket"
//! utc_offset_minutes = 60
//!
//! [access]
//! pin_hashes = ["$argon2id$v=19$m=19456,t=2,p=1$..."]
//! max_attempts = 5
//! window_secs = 300
//! pin_timeout_secs = 120
//!
//! [auth]
//! jwt_secret = "..."
//! issuer = "cue-identity"
//!
//! [database]
//! path = "./cue_hall.db"
//!
//! [hub]
//! channel_capacity = 256
//! ```

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use cue_db::DbConfig;
use cue_sync::HubConfig;

/// Secret used when none is configured. Refused by `validate` once
/// `auth.allow_dev_secret` is turned off.
pub const DEV_JWT_SECRET: &str = "cue-hall-dev-secret-change-me";

// =============================================================================
// Sections
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Deadline for one mutating action, persistence included.
    #[serde(default = "default_action_timeout")]
    pub action_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueSettings {
    #[serde(default = "default_venue_name")]
    pub name: String,

    /// Offset of the venue's wall clock from UTC, for tariff restrictions.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessSettings {
    /// argon2 PHC strings of the manager PINs.
    #[serde(default)]
    pub pin_hashes: Vec<String>,

    /// Failed PIN attempts allowed per window.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// How long a parked action waits for a PIN.
    #[serde(default = "default_pin_timeout")]
    pub pin_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,

    /// Expected `iss` claim. Not checked when unset.
    #[serde(default)]
    pub issuer: Option<String>,

    #[serde(default = "default_true")]
    pub allow_dev_secret: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    #[serde(default)]
    pub in_memory: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSettings {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    #[serde(default = "default_hello_timeout")]
    pub hello_timeout_secs: u64,

    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
}

// =============================================================================
// Defaults
// =============================================================================

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_action_timeout() -> u64 {
    5_000
}
fn default_venue_name() -> String {
    "Cue Hall".to_string()
}
fn default_max_attempts() -> u32 {
    5
}
fn default_window_secs() -> u64 {
    300
}
fn default_pin_timeout() -> u64 {
    120
}
fn default_jwt_secret() -> String {
    DEV_JWT_SECRET.to_string()
}
fn default_true() -> bool {
    true
}
fn default_db_path() -> PathBuf {
    PathBuf::from("./cue_hall.db")
}
fn default_channel_capacity() -> usize {
    256
}
fn default_hello_timeout() -> u64 {
    10
}
fn default_ping_interval() -> u64 {
    30
}
fn default_log_level() -> String {
    "info,hall_server=debug".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            bind_addr: default_bind_addr(),
            port: default_port(),
            action_timeout_ms: default_action_timeout(),
        }
    }
}

impl Default for VenueSettings {
    fn default() -> Self {
        VenueSettings {
            name: default_venue_name(),
            utc_offset_minutes: 0,
        }
    }
}

impl Default for AccessSettings {
    fn default() -> Self {
        AccessSettings {
            pin_hashes: Vec::new(),
            max_attempts: default_max_attempts(),
            window_secs: default_window_secs(),
            pin_timeout_secs: default_pin_timeout(),
        }
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        AuthSettings {
            jwt_secret: default_jwt_secret(),
            issuer: None,
            allow_dev_secret: default_true(),
        }
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_db_path(),
            in_memory: false,
        }
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        HubSettings {
            channel_capacity: default_channel_capacity(),
            hello_timeout_secs: default_hello_timeout(),
            ping_interval_secs: default_ping_interval(),
        }
    }
}

// =============================================================================
// Hall Configuration
// =============================================================================

/// Complete hall server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HallConfig {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub venue: VenueSettings,

    #[serde(default)]
    pub access: AccessSettings,

    #[serde(default)]
    pub auth: AuthSettings,

    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub hub: HubSettings,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for HallConfig {
    fn default() -> Self {
        HallConfig {
            server: ServerSettings::default(),
            venue: VenueSettings::default(),
            access: AccessSettings::default(),
            auth: AuthSettings::default(),
            database: DatabaseSettings::default(),
            hub: HubSettings::default(),
            log_level: default_log_level(),
        }
    }
}

impl HallConfig {
    /// Loads configuration from file, environment, and defaults.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut config = match config_path.or_else(Self::default_config_path) {
            Some(path) if path.exists() => Self::from_file(&path)?,
            Some(path) => {
                debug!(?path, "Config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads config or returns defaults if loading fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load hall config: {}. Using defaults.", e);
            Self::default()
        })
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        info!(?path, "Loading hall config from file");
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {e}", path.display())))?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "cue", "hall")
            .map(|dirs| dirs.config_dir().join("hall.toml"))
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.action_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue("server.action_timeout_ms".into()));
        }
        if self.venue.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(ConfigError::InvalidValue("venue.utc_offset_minutes".into()));
        }
        if self.access.max_attempts == 0 {
            return Err(ConfigError::InvalidValue("access.max_attempts".into()));
        }
        if self.access.window_secs == 0 {
            return Err(ConfigError::InvalidValue("access.window_secs".into()));
        }
        if self.access.pin_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue("access.pin_timeout_secs".into()));
        }
        if self.auth.jwt_secret.trim().is_empty() {
            return Err(ConfigError::MissingRequired("auth.jwt_secret".into()));
        }
        if self.auth.jwt_secret == DEV_JWT_SECRET && !self.auth.allow_dev_secret {
            return Err(ConfigError::MissingRequired("auth.jwt_secret".into()));
        }
        if self.hub.channel_capacity == 0 {
            return Err(ConfigError::InvalidValue("hub.channel_capacity".into()));
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(addr) = std::env::var("CUE_BIND_ADDR") {
            self.server.bind_addr = addr;
        }
        if let Some(port) = env_parse("CUE_PORT")? {
            self.server.port = port;
        }
        if let Some(ms) = env_parse("CUE_ACTION_TIMEOUT_MS")? {
            self.server.action_timeout_ms = ms;
        }
        if let Some(offset) = env_parse("CUE_UTC_OFFSET_MINUTES")? {
            self.venue.utc_offset_minutes = offset;
        }
        if let Ok(secret) = std::env::var("CUE_JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Ok(hashes) = std::env::var("CUE_PIN_HASHES") {
            self.access.pin_hashes = hashes
                .split(';')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(path) = std::env::var("CUE_DATABASE_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Ok(level) = std::env::var("CUE_LOG_LEVEL") {
            self.log_level = level;
        }
        Ok(())
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.server.bind_addr, self.server.port)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.server.action_timeout_ms)
    }

    pub fn pin_timeout(&self) -> Duration {
        Duration::from_secs(self.access.pin_timeout_secs)
    }

    pub fn attempt_window(&self) -> Duration {
        Duration::from_secs(self.access.window_secs)
    }

    /// The venue's fixed UTC offset. Falls back to UTC if out of range.
    pub fn venue_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.venue.utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix())
    }

    pub fn db_config(&self) -> DbConfig {
        if self.database.in_memory {
            DbConfig::in_memory()
        } else {
            DbConfig::new(&self.database.path)
        }
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            channel_capacity: self.hub.channel_capacity,
            hello_timeout: Duration::from_secs(self.hub.hello_timeout_secs),
            ping_interval: Duration::from_secs(self.hub.ping_interval_secs),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        Err(_) => Ok(None),
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}")]
    InvalidValue(String),

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Failed to read config: {0}")]
    Read(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = HallConfig::default();
        config.validate().unwrap();
        assert_eq!(config.socket_addr(), "0.0.0.0:8080");
        assert_eq!(config.action_timeout(), Duration::from_secs(5));
        assert_eq!(config.access.max_attempts, 5);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: HallConfig = toml::from_str(
            r#"
            [venue]
            utc_offset_minutes = -300

            [access]
            max_attempts = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.access.max_attempts, 3);
        assert_eq!(config.access.window_secs, 300);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.venue_offset().local_minus_utc(), -300 * 60);
        assert_eq!(config.log_level, "info,hall_server=debug");
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = HallConfig::default();
        config.access.max_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_dev_secret_can_be_refused() {
        let mut config = HallConfig::default();
        config.auth.allow_dev_secret = false;
        assert!(matches!(config.validate(), Err(ConfigError::MissingRequired(_))));

        config.auth.jwt_secret = "a-real-secret".into();
        config.validate().unwrap();
    }
}
