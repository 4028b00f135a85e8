//! Configuration module
//!
//! Handles engine settings and where they are stored

mod settings;

pub use settings::{ConfigError, EngineConfig};

use directories::ProjectDirs;
use std::path::PathBuf;

/// Name of the settings file inside the config directory
pub const CONFIG_FILE: &str = "sensorlink.toml";

/// Get the configuration directory
pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "sensorlink", "SensorLink")
        .map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path of the settings file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join(CONFIG_FILE))
}

/// Create the configuration directory
pub fn init_directories() -> std::io::Result<()> {
    if let Some(dir) = config_dir() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(())
}
