use std::{collections::HashMap, path::Path, time::Duration};

use config::{Config, ConfigError, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),
}

fn default_logs_dir() -> String {
    "logs".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    #[serde(default = "LinkConfig::default_settle_secs")]
    pub settle_secs: u64,
    #[serde(default = "LinkConfig::default_backoff_secs")]
    pub backoff_secs: u64,
    #[serde(default = "LinkConfig::default_grace_secs")]
    pub grace_secs: u64,
}

impl LinkConfig {
    fn default_settle_secs() -> u64 {
        5
    }

    fn default_backoff_secs() -> u64 {
        30
    }

    fn default_grace_secs() -> u64 {
        2
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            settle_secs: Self::default_settle_secs(),
            backoff_secs: Self::default_backoff_secs(),
            grace_secs: Self::default_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    #[serde(default = "MarketConfig::default_profile_fetch_secs")]
    pub profile_fetch_secs: u64,
    #[serde(default = "MarketConfig::default_autoreply_interval_ms")]
    pub autoreply_interval_ms: u64,
}

impl MarketConfig {
    fn default_profile_fetch_secs() -> u64 {
        10
    }

    fn default_autoreply_interval_ms() -> u64 {
        1000
    }

    pub fn profile_fetch(&self) -> Duration {
        Duration::from_secs(self.profile_fetch_secs)
    }

    pub fn autoreply_interval(&self) -> Duration {
        Duration::from_millis(self.autoreply_interval_ms)
    }
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            profile_fetch_secs: Self::default_profile_fetch_secs(),
            autoreply_interval_ms: Self::default_autoreply_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentsConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub default_key: Option<String>,
    #[serde(default)]
    pub wallet_keys: HashMap<String, String>,
    #[serde(default = "PaymentsConfig::default_poll_secs")]
    pub poll_secs: u64,
}

impl PaymentsConfig {
    fn default_poll_secs() -> u64 {
        10
    }

    pub fn poll(&self) -> Duration {
        Duration::from_secs(self.poll_secs.max(1))
    }
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            url: None,
            default_key: None,
            wallet_keys: HashMap::new(),
            poll_secs: Self::default_poll_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatesConfig {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Configuration {
    #[serde(default = "default_logs_dir")]
    pub logs_dir: String,
    pub relay_url: String,
    #[serde(default)]
    pub data_path: Option<String>,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub market: MarketConfig,
    #[serde(default)]
    pub payments: PaymentsConfig,
    #[serde(default)]
    pub rates: RatesConfig,
}

/// Merchant registered at startup when its key is not yet known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerchantSeed {
    pub private_key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub about: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub config: Configuration,
    #[serde(default)]
    pub merchants: Vec<MerchantSeed>,
}

impl Settings {
    pub fn load(config_path: &Path) -> Result<Self, SettingsError> {
        let builder = Config::builder().add_source(File::from(config_path).required(true));

        match builder.build() {
            Ok(cfg) => match cfg.try_deserialize::<Settings>() {
                Ok(settings) => Ok(settings),
                Err(err) => {
                    error!("Failed to deserialize configuration: {err}");
                    Err(SettingsError::Load(err))
                }
            },
            Err(err) => {
                error!(
                    "Failed to load configuration from '{}': {err}",
                    config_path.display()
                );
                Err(SettingsError::Load(err))
            }
        }
    }
}
