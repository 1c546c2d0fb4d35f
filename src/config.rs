use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionLimits;
use crate::session::SessionLimits;

/// Default listener port.
pub const DEFAULT_PORT: u16 = 9876;

/// Runtime configuration for the command server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listener address. Must be a loopback address.
    pub bind: SocketAddr,
    /// How long a connectionless session is kept before it is destroyed.
    pub grace_period: Duration,
    pub sweep_interval: Duration,
    /// Inactivity after which the sweep reclaims a connectionless session.
    pub stale_after: Duration,
    pub command_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_handshake_bytes: usize,
    pub max_frame_buffer_bytes: usize,
    pub event_log_capacity: usize,
    pub action_log_capacity: usize,
    /// Delay before retrying a bind that failed with "address in use".
    pub bind_retry: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            grace_period: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(600),
            stale_after: Duration::from_secs(1800),
            command_timeout: Duration::from_secs(120),
            handshake_timeout: Duration::from_secs(10),
            max_handshake_bytes: 16 * 1024,
            max_frame_buffer_bytes: 32 * 1024 * 1024,
            event_log_capacity: 200,
            action_log_capacity: 5000,
            bind_retry: Duration::from_secs(5),
        }
    }
}

/// On-disk form of [`ServerConfig`]. Every key is optional; durations are
/// whole seconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub bind: Option<SocketAddr>,
    pub grace_period_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
    pub stale_after_secs: Option<u64>,
    pub command_timeout_secs: Option<u64>,
    pub handshake_timeout_secs: Option<u64>,
    pub max_handshake_bytes: Option<usize>,
    pub max_frame_buffer_bytes: Option<usize>,
    pub event_log_capacity: Option<usize>,
    pub action_log_capacity: Option<usize>,
    pub bind_retry_secs: Option<u64>,
}

impl ConfigFile {
    /// Load from a TOML file. Returns `None` if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let file: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(file))
    }
}

/// `<config dir>/tabctl/config.toml`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tabctl").join("config.toml"))
}

impl ServerConfig {
    /// Defaults overlaid with the file at `path` (if it exists), validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(file) = path.map(ConfigFile::load).transpose()?.flatten() {
            config.apply(file);
        }
        config.validate()?;
        Ok(config)
    }

    /// Overlay the keys present in `file`.
    pub fn apply(&mut self, file: ConfigFile) {
        let secs = Duration::from_secs;
        if let Some(bind) = file.bind {
            self.bind = bind;
        }
        if let Some(v) = file.grace_period_secs {
            self.grace_period = secs(v);
        }
        if let Some(v) = file.sweep_interval_secs {
            self.sweep_interval = secs(v);
        }
        if let Some(v) = file.stale_after_secs {
            self.stale_after = secs(v);
        }
        if let Some(v) = file.command_timeout_secs {
            self.command_timeout = secs(v);
        }
        if let Some(v) = file.handshake_timeout_secs {
            self.handshake_timeout = secs(v);
        }
        if let Some(v) = file.max_handshake_bytes {
            self.max_handshake_bytes = v;
        }
        if let Some(v) = file.max_frame_buffer_bytes {
            self.max_frame_buffer_bytes = v;
        }
        if let Some(v) = file.event_log_capacity {
            self.event_log_capacity = v;
        }
        if let Some(v) = file.action_log_capacity {
            self.action_log_capacity = v;
        }
        if let Some(v) = file.bind_retry_secs {
            self.bind_retry = secs(v);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.bind.ip().is_loopback() {
            return Err(ConfigError::NotLoopback(self.bind));
        }
        let zero = [
            ("sweep_interval_secs", self.sweep_interval.is_zero()),
            ("command_timeout_secs", self.command_timeout.is_zero()),
            ("handshake_timeout_secs", self.handshake_timeout.is_zero()),
            ("max_handshake_bytes", self.max_handshake_bytes == 0),
            ("max_frame_buffer_bytes", self.max_frame_buffer_bytes == 0),
            ("event_log_capacity", self.event_log_capacity == 0),
            ("action_log_capacity", self.action_log_capacity == 0),
        ];
        match zero.iter().find(|(_, is_zero)| *is_zero) {
            Some((key, _)) => Err(ConfigError::Invalid(key, "must be greater than zero")),
            None => Ok(()),
        }
    }

    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            grace_period: self.grace_period,
            event_log_capacity: self.event_log_capacity,
            action_log_capacity: self.action_log_capacity,
        }
    }

    pub fn connection_limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            handshake_timeout: self.handshake_timeout,
            max_handshake_bytes: self.max_handshake_bytes,
            max_frame_buffer_bytes: self.max_frame_buffer_bytes,
        }
    }
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    NotLoopback(SocketAddr),
    Invalid(&'static str, &'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::NotLoopback(addr) => {
                write!(f, "Refusing to bind {addr}: only loopback addresses are allowed")
            }
            Self::Invalid(key, reason) => write!(f, "Invalid config value {key}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind.port(), 9876);
        assert_eq!(config.grace_period, Duration::from_secs(300));
        assert_eq!(config.command_timeout, Duration::from_secs(120));
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::load(Some(&dir.path().join("nope.toml"))).unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn file_overrides_selected_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
                bind = "127.0.0.1:9999"
                grace_period_secs = 30
                event_log_capacity = 50
            "#,
        )
        .unwrap();
        let config = ServerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.bind.port(), 9999);
        assert_eq!(config.grace_period, Duration::from_secs(30));
        assert_eq!(config.session_limits().event_log_capacity, 50);
        assert_eq!(config.stale_after, Duration::from_secs(1800));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "grace_perod_secs = 3\n").unwrap();
        let err = ServerConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(..)));
    }

    #[test]
    fn non_loopback_bind_is_rejected() {
        let config = ServerConfig {
            bind: "0.0.0.0:9876".parse().unwrap(),
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::NotLoopback(_))));
        let v6 = ServerConfig {
            bind: "[::1]:9876".parse().unwrap(),
            ..ServerConfig::default()
        };
        assert!(v6.validate().is_ok());
    }

    #[test]
    fn zero_limits_are_rejected() {
        let config = ServerConfig {
            command_timeout: Duration::ZERO,
            ..ServerConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid config value command_timeout_secs: must be greater than zero"
        );
    }
}
