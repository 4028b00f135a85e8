//! Engine settings

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No platform config directory
    #[error("Could not determine config directory")]
    NoConfigDir,

    /// Reading or writing the file failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML for this schema
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Serialization failed
    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Protocol engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Time allowed for a command response after it is written (ms)
    pub command_timeout_ms: u64,
    /// Period of the queue tick task (ms)
    pub tick_interval_ms: u64,
    /// Age after which a partial response is discarded (ms)
    pub reassembly_timeout_ms: u64,
    /// Chunk size override; the transport's own limit is used when unset
    pub max_packet_len: Option<usize>,
    /// Keep every decoded value in sensor history
    pub keep_values: bool,
    /// Measurement period used by `start(None)`; the derived period when unset
    pub default_period_ms: Option<f64>,
    /// Buffer size of event broadcast channels
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 5000,
            tick_interval_ms: 10,
            reassembly_timeout_ms: 2000,
            max_packet_len: None,
            keep_values: true,
            default_period_ms: None,
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Load config from the platform config directory, or defaults if absent
    pub fn load() -> Result<Self, ConfigError> {
        let path = super::config_path().ok_or(ConfigError::NoConfigDir)?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to the platform config directory
    pub fn save(&self) -> Result<(), ConfigError> {
        super::init_directories()?;
        let path = super::config_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)
    }

    /// Load config from a file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save config to a file
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Command response timeout
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Tick period; never zero
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// Partial response stall timeout
    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_millis(self.reassembly_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.command_timeout(), Duration::from_secs(5));
        assert_eq!(config.tick_interval(), Duration::from_millis(10));
        assert_eq!(config.reassembly_timeout(), Duration::from_secs(2));
        assert!(config.keep_values);
    }

    #[test]
    fn test_roundtrip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        let config = EngineConfig {
            max_packet_len: Some(20),
            default_period_ms: Some(250.0),
            ..EngineConfig::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(EngineConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "command_timeout_ms = 750\n").unwrap();

        let config = EngineConfig::load_from(&path).unwrap();
        assert_eq!(config.command_timeout_ms, 750);
        assert_eq!(config.tick_interval_ms, 10);
        assert_eq!(config.max_packet_len, None);
    }

    #[test]
    fn test_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "keep_values = \"yes\"\n").unwrap();
        assert!(matches!(EngineConfig::load_from(&path), Err(ConfigError::Parse(_))));
    }
}
