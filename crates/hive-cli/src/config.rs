//! Configuration loading

use anyhow::Result;
use hive_core::RigConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Contents of `hive.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HiveConfig {
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub naming: NamingConfig,
    /// Configuration given to rigs whose file carries none
    #[serde(default)]
    pub rig: RigConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Directory holding `<name>.template` files and the manifest
    #[serde(default = "default_library_path")]
    pub path: PathBuf,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            path: default_library_path(),
        }
    }
}

fn default_library_path() -> PathBuf {
    PathBuf::from("templates")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamingConfig {
    /// Extra preset files loaded after the built-in preset
    #[serde(default)]
    pub presets: Vec<PathBuf>,
    /// Preset used instead of the one in `[rig]`
    #[serde(default)]
    pub default_preset: Option<String>,
}

/// Load configuration from file, falling back to defaults when it is missing
pub fn load_config(path: &Path) -> Result<HiveConfig> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: HiveConfig = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(HiveConfig::default())
    }
}
