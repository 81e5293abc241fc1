//! Configuration file support for the blood bank.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/bloodbank/config.toml`.
//! Every key is optional; missing sections fall back to their defaults.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub stock: StockConfig,

    #[serde(default)]
    pub donors: DonorConfig,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl DataConfig {
    /// Location of the ledger WAL inside the data directory
    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("wal").join("ledger.wal")
    }

    /// Location of the donor/recipient registry inside the data directory
    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("registry.json")
    }
}

/// Stock alert configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StockConfig {
    /// Groups with fewer available units than this are reported as low
    #[serde(default = "default_low_stock_threshold")]
    pub low_stock_threshold: u64,
}

impl Default for StockConfig {
    fn default() -> Self {
        Self {
            low_stock_threshold: default_low_stock_threshold(),
        }
    }
}

/// Donor eligibility configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DonorConfig {
    /// Minimum days between two donations by the same donor
    #[serde(default = "default_eligibility_days")]
    pub eligibility_days: i64,
}

impl Default for DonorConfig {
    fn default() -> Self {
        Self {
            eligibility_days: default_eligibility_days(),
        }
    }
}

// Default value functions
fn home_dir() -> PathBuf {
    dirs::home_dir()
        .or_else(|| std::env::var_os("HOME").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| home_dir().join(".local/share"));
    base.join("bloodbank")
}

fn default_low_stock_threshold() -> u64 {
    5
}

fn default_eligibility_days() -> i64 {
    90
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::debug!("No config file found at {:?}, using defaults", config_path);
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| home_dir().join(".config"));
        base.join("bloodbank").join("config.toml")
    }

    /// Reject values no deployment could mean
    pub fn validate(&self) -> Result<()> {
        if self.donors.eligibility_days < 0 {
            return Err(Error::Config(format!(
                "donors.eligibility_days must not be negative, got {}",
                self.donors.eligibility_days
            )));
        }
        if self.data.data_dir.as_os_str().is_empty() {
            return Err(Error::Config("data.data_dir must not be empty".into()));
        }
        Ok(())
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.stock.low_stock_threshold, 5);
        assert_eq!(config.donors.eligibility_days, 90);
        assert!(config.data.data_dir.ends_with("bloodbank"));
    }

    #[test]
    fn test_data_paths() {
        let data = DataConfig {
            data_dir: PathBuf::from("/srv/bank"),
        };
        assert_eq!(data.wal_path(), PathBuf::from("/srv/bank/wal/ledger.wal"));
        assert_eq!(data.registry_path(), PathBuf::from("/srv/bank/registry.json"));
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
[stock]
low_stock_threshold = 10
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.stock.low_stock_threshold, 10);
        assert_eq!(config.donors.eligibility_days, 90); // default
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.data.data_dir = temp_dir.path().join("data");
        config.donors.eligibility_days = 56;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.data.data_dir, config.data.data_dir);
        assert_eq!(loaded.donors.eligibility_days, 56);
        assert_eq!(loaded.stock.low_stock_threshold, 5);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");

        std::fs::write(&path, "[donors]\neligibility_days = -1\n").unwrap();
        assert!(matches!(Config::load_from(&path), Err(Error::Config(_))));

        std::fs::write(&path, "[stock\nlow_stock_threshold = ").unwrap();
        assert!(matches!(Config::load_from(&path), Err(Error::Toml(_))));
    }
}
