use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bridge::BridgeOptions;
use crate::pty::CliCommand;
use crate::session::SpawnOptions;

/// Bridge configuration, loaded from TOML. Every key is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub bind: SocketAddr,
    /// HS256 secret for connection tokens. Generated per process when unset.
    pub jwt_secret: Option<String>,
    pub db_path: Option<PathBuf>,
    pub upload_dir: Option<PathBuf>,
    pub max_upload_mb: u64,
    pub program: String,
    /// Overrides `$SHELL`.
    pub shell: Option<String>,
    pub history_chunks: usize,
    pub max_sessions: usize,
    pub max_connections: usize,
    pub upgrade_rate_per_sec: Option<u32>,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_commands: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_commands: crate::ratelimit::DEFAULT_MAX_PER_WINDOW,
            window_secs: crate::ratelimit::DEFAULT_WINDOW.as_secs(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3443)),
            jwt_secret: None,
            db_path: None,
            upload_dir: None,
            max_upload_mb: 10,
            program: "claude".to_string(),
            shell: None,
            history_chunks: crate::history::DEFAULT_HISTORY_CHUNKS,
            max_sessions: crate::registry::DEFAULT_MAX_SESSIONS,
            max_connections: crate::api::DEFAULT_MAX_CONNECTIONS,
            upgrade_rate_per_sec: None,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// `<config_dir>/ccbridge/config.toml`, when the platform has one.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("ccbridge").join("config.toml"))
    }

    /// Load config from a TOML file path. Returns None if file doesn't exist.
    ///
    /// Checks file permissions and warns if world-readable.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        // Warn if the config file is world-readable (may contain the JWT secret).
        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self::load(path)?.unwrap_or_default())
    }

    fn data_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("ccbridge"))
    }

    /// Configured database path, else `<data_dir>/ccbridge/sessions.db`.
    /// `None` means records are kept in memory only.
    pub fn resolved_db_path(&self) -> Option<PathBuf> {
        self.db_path
            .clone()
            .or_else(|| Self::data_dir().map(|d| d.join("sessions.db")))
    }

    pub fn resolved_upload_dir(&self) -> PathBuf {
        self.upload_dir
            .clone()
            .or_else(|| Self::data_dir().map(|d| d.join("uploads")))
            .unwrap_or_else(|| std::env::temp_dir().join("ccbridge-uploads"))
    }

    pub fn max_upload_bytes(&self) -> usize {
        usize::try_from(self.max_upload_mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
    }

    /// Largest WebSocket message a client may send: a base64 photo at the
    /// upload limit plus envelope overhead.
    pub fn max_message_size(&self) -> usize {
        (self.max_upload_bytes() / 3 + 1)
            .saturating_mul(4)
            .saturating_add(64 * 1024)
    }

    pub fn bridge_options(&self) -> BridgeOptions {
        let mut command = CliCommand {
            program: self.program.clone(),
            ..CliCommand::default()
        };
        if let Some(shell) = &self.shell {
            command.shell = shell.clone();
        }
        BridgeOptions {
            spawn: SpawnOptions {
                command,
                history_chunks: self.history_chunks,
                ..SpawnOptions::default()
            },
            max_sessions: self.max_sessions,
            rate_limit_max: self.rate_limit.max_commands,
            rate_limit_window: Duration::from_secs(self.rate_limit.window_secs.max(1)),
            max_upload_bytes: self.max_upload_bytes(),
            ..BridgeOptions::default()
        }
    }
}

/// Errors that can occur when loading config.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {}: {}", .0.display(), .1)]
    ReadFailed(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config {}: {}", .0.display(), .1)]
    ParseFailed(PathBuf, #[source] toml::de::Error),
}

/// Check file permissions on a config file and warn if world-readable.
///
/// On Unix, checks `st_mode & 0o004` (world-readable bit). If set, logs a
/// warning because the config file may contain the JWT secret.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "Config file {} is world-readable (mode {:o}). \
             It may contain the JWT secret -- consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

/// Returns true if the given file mode has the world-readable bit set.
#[cfg(unix)]
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}
