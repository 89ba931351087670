//! Player configuration file.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use carillon_core::DeviceConfig;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// File name looked up in the user's config directory.
pub const CONFIG_FILE_NAME: &str = "carillon.json";

/// Settings read from `carillon.json`. Every field is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub device: DeviceConfig,
    /// Volume for every file, 0.0 to 1.0.
    pub volume: f64,
    /// Panning for every file, -1.0 (left) to 1.0 (right).
    pub panning: f64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            volume: 1.0,
            panning: 0.0,
        }
    }
}

impl AppConfig {
    /// Default location of the config file, if the platform has a config
    /// directory.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "carillon", "Carillon")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Load `path`, or the default file when `path` is `None`. A missing
    /// default file yields the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => {
                    debug!("No config file, using defaults");
                    Ok(Self::default())
                }
            },
        }
    }

    fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = serde_json::from_str(&text)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }
}
