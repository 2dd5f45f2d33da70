//! Registry configuration
//!
//! Serializable to/from JSON so hosts can ship it alongside their own settings.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_DATABASE_NAME: &str = "beacons";
pub const DEFAULT_LEGACY_PREFERENCES_NAME: &str = "beacons.prefs";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Invalid(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Logical name of the beacon store, opened under the host data directory
    pub database_name: String,

    /// Preference file left behind by older releases, purged on first initialize
    pub legacy_preferences_name: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            database_name: DEFAULT_DATABASE_NAME.to_string(),
            legacy_preferences_name: DEFAULT_LEGACY_PREFERENCES_NAME.to_string(),
        }
    }
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\\']) && name != "." && name != ".."
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_plain_name(&self.database_name) {
            return Err(ConfigError::Invalid(format!(
                "database_name must be a plain file name, got {:?}",
                self.database_name
            )));
        }
        if !is_plain_name(&self.legacy_preferences_name) {
            return Err(ConfigError::Invalid(format!(
                "legacy_preferences_name must be a plain file name, got {:?}",
                self.legacy_preferences_name
            )));
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        let config = RegistryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.database_name, "beacons");
        assert_eq!(config.legacy_preferences_name, "beacons.prefs");
    }

    #[test]
    fn test_rejects_path_like_names() {
        for name in ["", "a/b", "..", "c:\\db"] {
            let config = RegistryConfig {
                database_name: name.to_string(),
                ..RegistryConfig::default()
            };
            assert!(config.validate().is_err(), "{:?} accepted", name);
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conf").join("registry.json");
        let config = RegistryConfig {
            database_name: "fleet".to_string(),
            legacy_preferences_name: "fleet.prefs".to_string(),
        };

        config.save(&path).unwrap();
        assert_eq!(RegistryConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: RegistryConfig = serde_json::from_str(r#"{"database_name":"x"}"#).unwrap();
        assert_eq!(config.database_name, "x");
        assert_eq!(config.legacy_preferences_name, DEFAULT_LEGACY_PREFERENCES_NAME);
    }
}
