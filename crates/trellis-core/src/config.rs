//! Configuration management for trellis
//!
//! Handles loading and validation of `trellis.toml`. Every section is
//! optional; missing keys take their defaults. Environment overrides are
//! applied once at startup, after the file is read.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::{LogConfig, LogLevel};
use crate::persistence::PersistenceConfig;
use crate::server::{DEFAULT_REQUEST_TIMEOUT_MS, ServerOptions, SocketMode};
use crate::session::SurfaceSettings;
use crate::surface::CaptureLimits;
use crate::surface::terminal::{DEFAULT_ROWS, DEFAULT_SCROLLBACK_LIMIT};

/// Default application identity; names the snapshot file.
pub const DEFAULT_APP_ID: &str = "dev.trellis.app";

/// Environment variables read by [`Config::apply_env`].
pub const ENV_SOCKET_PATH: &str = "TRELLIS_SOCKET_PATH";
pub const ENV_SOCKET_MODE: &str = "TRELLIS_SOCKET_MODE";
pub const ENV_SNAPSHOT_DIR: &str = "TRELLIS_SNAPSHOT_DIR";
pub const ENV_APP_ID: &str = "TRELLIS_APP_ID";
pub const ENV_LOG_LEVEL: &str = "TRELLIS_LOG_LEVEL";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Application identity; one snapshot file per identity
    pub app_id: String,
    pub socket: SocketConfig,
    pub snapshot: SnapshotConfig,
    pub terminal: TerminalConfig,
    pub logging: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_id: DEFAULT_APP_ID.to_string(),
            socket: SocketConfig::default(),
            snapshot: SnapshotConfig::default(),
            terminal: TerminalConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

/// Control socket settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub path: PathBuf,
    pub mode: SocketMode,
    pub request_timeout_ms: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            path: default_socket_path(),
            mode: SocketMode::Restricted,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

/// Snapshot settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub dir: PathBuf,
    /// Save after structural mutations
    pub autosave: bool,
    pub autosave_debounce_ms: u64,
    /// Scrollback bytes captured per terminal
    pub scrollback_max_bytes: usize,
    /// Browser history entries captured per surface
    pub history_max_entries: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        let limits = CaptureLimits::default();
        Self {
            dir: default_snapshot_dir(),
            autosave: true,
            autosave_debounce_ms: 250,
            scrollback_max_bytes: limits.scrollback_max_bytes,
            history_max_entries: limits.history_max_entries,
        }
    }
}

/// Terminal surface settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Live scrollback retained per terminal
    pub scrollback_limit_bytes: usize,
    /// Rows of the visible screen
    pub rows: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            scrollback_limit_bytes: DEFAULT_SCROLLBACK_LIMIT,
            rows: DEFAULT_ROWS,
        }
    }
}

fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .map(|dir| dir.join("trellis").join("trellis.sock"))
        .unwrap_or_else(|| std::env::temp_dir().join("trellis.sock"))
}

fn default_snapshot_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("~/.local/share"))
        .join("trellis")
        .join("sessions")
}

/// Default config file location: `<config_dir>/trellis/trellis.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("trellis").join("trellis.toml"))
}

impl Config {
    /// Load the default config file if it exists, else defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match default_config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::ParseFailed(e.to_string()))
    }

    /// Apply `TRELLIS_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`; blank values are ignored.
    pub fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(path) = get(ENV_SOCKET_PATH) {
            self.socket.path = PathBuf::from(path);
        }
        if let Some(mode) = get(ENV_SOCKET_MODE) {
            self.socket.mode = SocketMode::parse(&mode).ok_or_else(|| {
                ConfigError::ValidationError(format!(
                    "{ENV_SOCKET_MODE}={mode} (expected restricted or allow-all)"
                ))
            })?;
        }
        if let Some(dir) = get(ENV_SNAPSHOT_DIR) {
            self.snapshot.dir = PathBuf::from(dir);
        }
        if let Some(app_id) = get(ENV_APP_ID) {
            self.app_id = app_id;
        }
        if let Some(level) = get(ENV_LOG_LEVEL) {
            self.logging.level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_id.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "app_id must not be empty".to_string(),
            ));
        }
        if self.socket.request_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "socket.request_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if !self.socket.path.is_absolute() {
            return Err(ConfigError::ValidationError(format!(
                "socket.path must be absolute, got {}",
                self.socket.path.display()
            )));
        }
        if self.terminal.rows == 0 {
            return Err(ConfigError::ValidationError(
                "terminal.rows must be greater than 0".to_string(),
            ));
        }
        if self.snapshot.scrollback_max_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "snapshot.scrollback_max_bytes must be greater than 0".to_string(),
            ));
        }
        self.logging
            .level
            .parse::<LogLevel>()
            .map_err(ConfigError::ValidationError)?;
        Ok(())
    }

    #[must_use]
    pub fn surface_settings(&self) -> SurfaceSettings {
        SurfaceSettings {
            scrollback_limit: self.terminal.scrollback_limit_bytes,
            rows: self.terminal.rows,
        }
    }

    #[must_use]
    pub fn persistence(&self) -> PersistenceConfig {
        PersistenceConfig {
            app_id: self.app_id.clone(),
            dir: self.snapshot.dir.clone(),
            limits: CaptureLimits {
                scrollback_max_bytes: self.snapshot.scrollback_max_bytes,
                history_max_entries: self.snapshot.history_max_entries,
            },
            surfaces: self.surface_settings(),
        }
    }

    #[must_use]
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions::new(self.socket.path.clone())
            .with_mode(self.socket.mode)
            .with_timeout(Duration::from_millis(self.socket.request_timeout_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.app_id, DEFAULT_APP_ID);
        assert_eq!(config.socket.mode, SocketMode::Restricted);
        assert_eq!(config.socket.request_timeout_ms, 5_000);
        assert_eq!(config.snapshot.autosave_debounce_ms, 250);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
app_id = "dev.trellis.test"
[socket]
path = "/tmp/trellis-test.sock"
mode = "allow-all"
[logging]
format = "json"
"#,
        )
        .unwrap();
        assert_eq!(config.app_id, "dev.trellis.test");
        assert_eq!(config.socket.mode, SocketMode::AllowAll);
        assert_eq!(config.socket.request_timeout_ms, 5_000);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.terminal.rows, DEFAULT_ROWS);
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        let err = Config::from_toml("[socket\npath = 1").unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(_)));
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_SOCKET_PATH, "/run/user/1000/t.sock"),
            (ENV_SOCKET_MODE, "allow-all"),
            (ENV_APP_ID, "dev.trellis.ci"),
            (ENV_LOG_LEVEL, "debug"),
            (ENV_SNAPSHOT_DIR, "   "),
        ]);
        let mut config = Config::default();
        let before_dir = config.snapshot.dir.clone();
        config
            .apply_env_from(|key| env.get(key).map(|v| (*v).to_string()))
            .unwrap();
        assert_eq!(config.socket.path, PathBuf::from("/run/user/1000/t.sock"));
        assert_eq!(config.socket.mode, SocketMode::AllowAll);
        assert_eq!(config.app_id, "dev.trellis.ci");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.snapshot.dir, before_dir);
    }

    #[test]
    fn invalid_socket_mode_env_is_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_env_from(|key| (key == ENV_SOCKET_MODE).then(|| "wide-open".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn validation_rules() {
        let mut config = Config::default();
        config.socket.request_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.app_id = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.socket.path = PathBuf::from("relative.sock");
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.level = "chatty".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn conversions_carry_settings() {
        let mut config = Config::default();
        config.terminal.rows = 40;
        config.snapshot.scrollback_max_bytes = 1024;
        let persistence = config.persistence();
        assert_eq!(persistence.surfaces.rows, 40);
        assert_eq!(persistence.limits.scrollback_max_bytes, 1024);
        assert_eq!(
            config.server_options().request_timeout,
            Duration::from_millis(5_000)
        );
    }
}
