//! # Terminal Configuration
//!
//! Configuration for a terminal connecting to the hall server.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     CUE_TERMINAL_ID=bar-1                                              │
//! │     CUE_HUB_URL=ws://192.168.1.10:8080/ws                              │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/cue-hall/terminal.toml (Linux)                           │
//! │     ~/Library/Application Support/com.cue.hall/terminal.toml (macOS)   │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     auto-generated terminal_id, all rooms                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [terminal]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Front desk"
//! rooms = ["main"]
//!
//! [hub]
//! url = "ws://192.168.1.10:8080/ws"
//! token = "eyJ..."
//!
//! [connection]
//! connect_timeout_secs = 10
//! initial_backoff_ms = 500
//! max_backoff_secs = 30
//! action_timeout_ms = 5000
//! snapshot_retries = 3
//! elevation_ttl_secs = 120
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use cue_core::ALL_ROOMS;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Terminal Identity
// =============================================================================

/// This terminal's identity and room subscriptions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalSettings {
    /// Unique terminal identifier.
    /// Auto-generated on first run if not provided.
    pub id: String,

    /// Human-readable name (e.g., "Front desk", "Bar").
    #[serde(default = "default_terminal_name")]
    pub name: String,

    /// Floor-plan rooms to follow. `*` follows every room.
    #[serde(default = "default_rooms")]
    pub rooms: Vec<String>,
}

fn default_terminal_name() -> String {
    "Hall Terminal".to_string()
}

fn default_rooms() -> Vec<String> {
    vec![ALL_ROOMS.to_string()]
}

impl Default for TerminalSettings {
    fn default() -> Self {
        TerminalSettings {
            id: Uuid::new_v4().to_string(),
            name: default_terminal_name(),
            rooms: default_rooms(),
        }
    }
}

// =============================================================================
// Hub Endpoint
// =============================================================================

/// Where the hall server's event channel lives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubEndpoint {
    /// WebSocket URL of the hall server's `/ws` route.
    #[serde(default)]
    pub url: Option<String>,

    /// Base URL of the REST API. Derived from `url` when unset.
    #[serde(default)]
    pub api_url: Option<String>,

    /// Bearer token presented in hello and on every REST call.
    #[serde(default)]
    pub token: Option<String>,
}

// =============================================================================
// Connection Settings
// =============================================================================

/// Reconnect and timeout behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Connection timeout (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Maximum reconnection attempts before giving up.
    /// Set to 0 for infinite retries.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff duration (milliseconds) for reconnection.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration (seconds) for reconnection.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Deadline for a mutating action or PIN verification (milliseconds).
    /// The optimistic view reverts when it passes.
    #[serde(default = "default_action_timeout")]
    pub action_timeout_ms: u64,

    /// How often an unanswered snapshot request is re-sent.
    #[serde(default = "default_snapshot_retries")]
    pub snapshot_retries: u32,

    /// How long a parked action waits for a manager PIN (seconds).
    #[serde(default = "default_elevation_ttl")]
    pub elevation_ttl_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}
fn default_max_retries() -> u32 {
    0 // Infinite
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    30
}
fn default_action_timeout() -> u64 {
    5_000
}
fn default_snapshot_retries() -> u32 {
    3
}
fn default_elevation_ttl() -> u64 {
    120
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            connect_timeout_secs: default_connect_timeout(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            action_timeout_ms: default_action_timeout(),
            snapshot_retries: default_snapshot_retries(),
            elevation_ttl_secs: default_elevation_ttl(),
        }
    }
}

// =============================================================================
// Main Terminal Configuration
// =============================================================================

/// Complete terminal configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TerminalConfig {
    #[serde(default)]
    pub terminal: TerminalSettings,

    #[serde(default)]
    pub hub: HubEndpoint,

    #[serde(default)]
    pub connection: ConnectionSettings,
}

impl TerminalConfig {
    /// Creates a new config with defaults and a generated terminal ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (terminal.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading terminal config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load terminal config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Terminal config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.terminal.id.trim().is_empty() {
            return Err(SyncError::MissingTerminalId);
        }

        if let Some(ref raw) = self.hub.url {
            let url = Url::parse(raw)?;
            if !matches!(url.scheme(), "ws" | "wss") {
                return Err(SyncError::InvalidUrl(format!(
                    "Hub URL must use ws:// or wss://, got: {}",
                    raw
                )));
            }
        }

        if self.terminal.rooms.is_empty() {
            return Err(SyncError::InvalidConfig(
                "terminal.rooms must name at least one room (or \"*\")".into(),
            ));
        }

        let c = &self.connection;
        if c.initial_backoff_ms == 0 || c.initial_backoff_ms > c.max_backoff_secs.saturating_mul(1000) {
            return Err(SyncError::InvalidConfig(
                "initial_backoff_ms must be positive and not exceed max_backoff_secs".into(),
            ));
        }
        if c.action_timeout_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "action_timeout_ms must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("CUE_TERMINAL_ID") {
            debug!(terminal_id = %id, "Overriding terminal ID from environment");
            self.terminal.id = id;
        }

        if let Ok(name) = std::env::var("CUE_TERMINAL_NAME") {
            self.terminal.name = name;
        }

        if let Ok(rooms) = std::env::var("CUE_TERMINAL_ROOMS") {
            self.terminal.rooms = rooms
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(String::from)
                .collect();
        }

        if let Ok(url) = std::env::var("CUE_HUB_URL") {
            debug!(url = %url, "Overriding hub URL from environment");
            self.hub.url = Some(url);
        }

        if let Ok(api_url) = std::env::var("CUE_API_URL") {
            self.hub.api_url = Some(api_url);
        }

        if let Ok(token) = std::env::var("CUE_HUB_TOKEN") {
            self.hub.token = Some(token);
        }

        if let Ok(ms) = std::env::var("CUE_ACTION_TIMEOUT_MS") {
            match ms.parse() {
                Ok(ms) => self.connection.action_timeout_ms = ms,
                Err(_) => warn!(value = %ms, "Ignoring invalid CUE_ACTION_TIMEOUT_MS"),
            }
        }
    }

    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "cue", "hall")
            .map(|dirs| dirs.config_dir().join("terminal.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn terminal_id(&self) -> &str {
        &self.terminal.id
    }

    pub fn hub_url(&self) -> Option<&str> {
        self.hub.url.as_deref()
    }

    /// REST base URL: `hub.api_url`, or the hub URL with an http(s) scheme
    /// and no path.
    pub fn api_base_url(&self) -> SyncResult<Url> {
        if let Some(raw) = &self.hub.api_url {
            return Ok(Url::parse(raw)?);
        }

        let raw = self
            .hub
            .url
            .as_deref()
            .ok_or_else(|| SyncError::InvalidConfig("Hub URL required".into()))?;
        let mut url = Url::parse(raw)?;
        let scheme = if url.scheme() == "wss" { "https" } else { "http" };
        url.set_scheme(scheme)
            .map_err(|_| SyncError::InvalidUrl(format!("Cannot derive API URL from {raw}")))?;
        url.set_path("");
        url.set_query(None);
        Ok(url)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.action_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.connect_timeout_secs)
    }

    pub fn elevation_ttl(&self) -> Duration {
        Duration::from_secs(self.connection.elevation_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TerminalConfig::default();
        assert!(!config.terminal.id.is_empty());
        assert_eq!(config.terminal.rooms, vec!["*".to_string()]);
        assert_eq!(config.action_timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = TerminalConfig::default();

        config.terminal.id = "  ".into();
        assert!(matches!(config.validate(), Err(SyncError::MissingTerminalId)));

        config.terminal.id = "bar-1".into();
        config.hub.url = Some("http://hall.local/ws".into());
        assert!(config.validate().is_err());

        config.hub.url = Some("not a url".into());
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));

        config.hub.url = Some("ws://hall.local:8080/ws".into());
        assert!(config.validate().is_ok());

        config.connection.initial_backoff_ms = 120_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip_keeps_sections() {
        let toml_str = r#"
            [terminal]
            id = "bar-1"
            rooms = ["main", "vip"]

            [hub]
            url = "ws://10.0.0.2:8080/ws"
        "#;
        let config: TerminalConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.terminal_id(), "bar-1");
        assert_eq!(config.terminal.name, "Hall Terminal");
        assert_eq!(config.connection.snapshot_retries, 3);

        let rendered = toml::to_string_pretty(&config).unwrap();
        assert!(rendered.contains("[connection]"));
    }

    #[test]
    fn test_api_url_derived_from_hub_url() {
        let mut config = TerminalConfig::default();
        config.hub.url = Some("wss://hall.example:8443/ws".into());
        assert_eq!(config.api_base_url().unwrap().as_str(), "https://hall.example:8443/");

        config.hub.api_url = Some("http://10.0.0.2:8080/".into());
        assert_eq!(config.api_base_url().unwrap().as_str(), "http://10.0.0.2:8080/");
    }
}
