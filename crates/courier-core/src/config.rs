//! Configuration system for Courier
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/courier/config.toml
//! - Linux: ~/.config/courier/config.toml
//! - Windows: %APPDATA%/courier/config.toml

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::FrameLimits;
use crate::types::ConflictPolicy;
use crate::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FILE_SIZE, DEFAULT_PORT, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server settings
    pub server: ServerConfig,
    /// Client settings
    pub client: ClientConfig,
    /// Limits shared by both sides
    pub transfer: TransferConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub bind: IpAddr,
    /// TCP port
    pub port: u16,
    /// Directory uploads are stored in and downloads are served from
    pub storage_dir: PathBuf,
    /// Sessions allowed to run at once; further connections queue
    pub max_sessions: usize,
    /// What to do when an upload's name is already taken
    pub on_conflict: ConflictPolicy,
    /// How long in-flight sessions may run after shutdown is requested
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            storage_dir: PathBuf::from("server_files"),
            max_sessions: 64,
            on_conflict: ConflictPolicy::KeepBoth,
            shutdown_grace_secs: 5,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server host name or address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Where downloads land when no output path is given
    pub download_dir: PathBuf,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: DEFAULT_PORT,
            download_dir: PathBuf::from("downloads"),
            connect_timeout_secs: 10,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Limits and pacing shared by both sides
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Payload chunk size in bytes
    pub chunk_size: usize,
    /// Largest declared file size a receiver accepts
    pub max_file_size: u64,
    /// Per read/write timeout in seconds (0 disables)
    pub io_timeout_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            io_timeout_secs: 30,
        }
    }
}

impl TransferConfig {
    pub fn io_timeout(&self) -> Option<Duration> {
        match self.io_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn limits(&self) -> FrameLimits {
        FrameLimits {
            max_file_size: self.max_file_size,
        }
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Check values that would make the server or client misbehave
    pub fn validate(&self) -> Result<(), ConfigError> {
        let chunk = self.transfer.chunk_size;
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk) {
            return Err(ConfigError::Invalid(format!(
                "transfer.chunk_size must be between {} and {} bytes, got {}",
                MIN_CHUNK_SIZE, MAX_CHUNK_SIZE, chunk
            )));
        }

        if self.transfer.max_file_size == 0 {
            return Err(ConfigError::Invalid(
                "transfer.max_file_size must be greater than zero".into(),
            ));
        }

        if self.server.max_sessions == 0 {
            return Err(ConfigError::Invalid(
                "server.max_sessions must be greater than zero".into(),
            ));
        }

        if self.client.host.trim().is_empty() {
            return Err(ConfigError::Invalid("client.host must not be empty".into()));
        }

        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "courier", "courier")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// I/O error
    Io(String),
    /// Parse error
    Parse(String),
    /// A value is out of range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Invalid(e) => write!(f, "Invalid configuration: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 5001);
        assert_eq!(config.client.port, 5001);
        assert_eq!(config.transfer.chunk_size, 64 * 1024);
        assert_eq!(config.server.on_conflict, ConflictPolicy::KeepBoth);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.server.port, config.server.port);
        assert_eq!(parsed.transfer.max_file_size, config.transfer.max_file_size);
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
            [server]
            port = 6000
            on_conflict = "overwrite"

            [transfer]
            io_timeout_secs = 0
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 6000);
        assert_eq!(config.server.on_conflict, ConflictPolicy::Overwrite);
        assert_eq!(config.transfer.io_timeout(), None);
        // Other values should be defaults
        assert_eq!(config.client.port, 5001);
        assert_eq!(config.transfer.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.transfer.chunk_size = 16;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.transfer.max_file_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.max_sessions = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.client.host = "  ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sample_config() {
        let sample = Config::sample();
        assert!(sample.contains("[server]"));
        assert!(sample.contains("[client]"));
        assert!(sample.contains("[transfer]"));
    }

    #[test]
    fn test_config_load_missing() {
        let config = Config::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.server.port, 5001); // Should use defaults
    }

    #[test]
    fn test_config_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[client]\nhost = \"files.local\"\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.client.host, "files.local");

        std::fs::write(&path, "[client\nhost = ").unwrap();
        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_bind_addr() {
        let config = ServerConfig {
            bind: "127.0.0.1".parse().unwrap(),
            port: 7000,
            ..ServerConfig::default()
        };
        assert_eq!(config.bind_addr(), "127.0.0.1:7000".parse().unwrap());
    }
}
