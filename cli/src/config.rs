// Configuration management for the beacons CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/beacons/config.json
// - Linux: ~/.config/beacons/config.json
// - Windows: %APPDATA%\beacons\config.json

use anyhow::{Context, Result};
use beacons_core::RegistryConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host package name reported to the registry
    pub package: String,

    /// Platform api level the CLI pretends to run on
    pub api_level: u32,

    /// Directory holding the beacon store
    pub storage_path: Option<String>,

    /// Registry settings
    pub registry: RegistryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            package: "beacons.cli".to_string(),
            api_level: 34,
            storage_path: None,
            registry: RegistryConfig::default(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("beacons");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the default data directory path (cross-platform)
    pub fn default_data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("beacons");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    /// Where the beacon store lives: `storage_path` if set, else the default
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.storage_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Self::default_data_dir(),
        }
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config
                .registry
                .validate()
                .context("Invalid registry settings in config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value. The caller persists it.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "package" => {
                anyhow::ensure!(!value.is_empty(), "package must not be empty");
                self.package = value.to_string();
            }
            "api_level" => {
                self.api_level = value.parse().context("Invalid api level")?;
            }
            "storage_path" => {
                self.storage_path = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "database_name" | "legacy_preferences_name" => {
                let mut registry = self.registry.clone();
                if key == "database_name" {
                    registry.database_name = value.to_string();
                } else {
                    registry.legacy_preferences_name = value.to_string();
                }
                registry.validate()?;
                self.registry = registry;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "package" => Some(self.package.clone()),
            "api_level" => Some(self.api_level.to_string()),
            "storage_path" => self.storage_path.clone(),
            "database_name" => Some(self.registry.database_name.clone()),
            "legacy_preferences_name" => Some(self.registry.legacy_preferences_name.clone()),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("package".to_string(), self.package.clone()),
            ("api_level".to_string(), self.api_level.to_string()),
            (
                "storage_path".to_string(),
                self.storage_path
                    .clone()
                    .unwrap_or_else(|| "(auto)".to_string()),
            ),
            (
                "database_name".to_string(),
                self.registry.database_name.clone(),
            ),
            (
                "legacy_preferences_name".to_string(),
                self.registry.legacy_preferences_name.clone(),
            ),
        ]
    }
}
