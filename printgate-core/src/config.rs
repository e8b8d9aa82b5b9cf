//! Configuration management for printgate
//!
//! Values are resolved in three layers, later ones winning:
//! - built-in defaults
//! - `config.toml` in the platform config directory (or `PRINTGATE_CONFIG`)
//!   - Linux: ~/.config/printgate/
//!   - macOS: ~/Library/Application Support/printgate/
//!   - Windows: %APPDATA%\printgate\
//! - environment variables (`REPETIER_*`, `CORS_ORIGIN`, `PORT`)
//!
//! The result is read once at startup and never changes afterwards.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::auth::Credentials;

/// Environment variable pointing at an explicit config file
pub const CONFIG_PATH_ENV: &str = "PRINTGATE_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Config directory not found")]
    NoDirFound,

    #[error("Invalid value for {key}: {value:?}")]
    InvalidEnv { key: &'static str, value: String },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Gateway listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Repetier Server connection
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

/// Gateway-side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// HTTP/WebSocket port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Origin allowed to open observer connections
    #[serde(default = "default_allowed_origin")]
    pub allowed_origin: String,

    /// Observer poll cadence in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

/// Upstream Repetier Server configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_host")]
    pub host: String,

    #[serde(default = "default_upstream_port")]
    pub port: u16,

    #[serde(default)]
    pub api_key: String,

    /// Login for session authentication. Without login and password the
    /// gateway runs on the API key alone.
    pub login: Option<String>,

    pub password: Option<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Printer index used by printer commands
    #[serde(default)]
    pub printer: u32,
}

// Default value functions
fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    crate::DEFAULT_LISTEN_PORT
}
fn default_allowed_origin() -> String {
    "http://localhost:3000".to_string()
}
fn default_poll_interval() -> u64 {
    crate::DEFAULT_POLL_INTERVAL_MS
}
fn default_upstream_host() -> String {
    "192.168.1.100".to_string()
}
fn default_upstream_port() -> u16 {
    crate::DEFAULT_UPSTREAM_PORT
}
fn default_request_timeout() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            port: default_port(),
            allowed_origin: default_allowed_origin(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: default_upstream_host(),
            port: default_upstream_port(),
            api_key: String::new(),
            login: None,
            password: None,
            request_timeout_secs: default_request_timeout(),
            printer: 0,
        }
    }
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("api_key", &"<redacted>")
            .field("login", &self.login)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("printer", &self.printer)
            .finish()
    }
}

impl ServerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl UpstreamConfig {
    /// Single endpoint every envelope is posted to
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}/printer/api/", self.host, self.port)
    }

    /// Per-request upstream timeout, at least one second
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(
            &self.api_key,
            self.login.as_deref(),
            self.password.as_deref(),
        )
    }
}

impl Config {
    /// Get config directory path
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|p| p.join("printgate"))
            .ok_or(ConfigError::NoDirFound)
    }

    /// Get config file path, honouring `PRINTGATE_CONFIG`
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
            return Ok(PathBuf::from(path));
        }
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load config from the default location, then apply environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(&Self::config_path()?, |key| std::env::var(key).ok())
    }

    /// Defaults, then the file at `path` if it exists, then overrides from `lookup`.
    ///
    /// Any failing layer fails the whole load; a partial config is never returned.
    pub fn resolve<F>(path: &Path, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = if path.exists() {
            Self::load_from(path)?
        } else {
            Self::default()
        };

        config.apply_overrides(lookup)?;
        Ok(config)
    }

    /// Load config from specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save config to specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply overrides from a variable lookup. Blank values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(host) = get("REPETIER_HOST") {
            self.upstream.host = host;
        }
        if let Some(port) = get("REPETIER_PORT") {
            self.upstream.port = parse_port("REPETIER_PORT", port)?;
        }
        if let Some(key) = get("REPETIER_API_KEY") {
            self.upstream.api_key = key;
        }
        if let Some(login) = get("REPETIER_LOGIN") {
            self.upstream.login = Some(login);
        }
        if let Some(password) = get("REPETIER_PASSWORD") {
            self.upstream.password = Some(password);
        }
        if let Some(origin) = get("CORS_ORIGIN") {
            self.server.allowed_origin = origin;
        }
        if let Some(port) = get("PORT") {
            self.server.port = parse_port("PORT", port)?;
        }

        Ok(())
    }
}

fn parse_port(key: &'static str, value: String) -> Result<u16, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { key, value })
}
