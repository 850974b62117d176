use serde::Deserialize;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::RwLock;

use backtrace::Backtrace;
use log::error;

use crate::model::{AppSettings, EmailAccount};

// Main configuration struct
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub app: AppSettings,
    #[serde(default)]
    pub accounts: Vec<EmailAccount>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    pub data_dir: String,
    #[serde(rename = "sync_interval")]
    pub sync_interval_seconds: u64,
    #[serde(default = "default_backoff_floor")]
    pub backoff_floor_seconds: u64,
    #[serde(default = "default_backoff_ceiling")]
    pub backoff_ceiling_seconds: u64,
    #[serde(default = "default_network_timeout")]
    pub network_timeout_seconds: u64,
    /// Consecutive failures before a retrying account is surfaced as degraded.
    #[serde(default = "default_surface_after")]
    pub surface_failures_after: u32,
}

fn default_backoff_floor() -> u64 {
    2
}

fn default_backoff_ceiling() -> u64 {
    300
}

fn default_network_timeout() -> u64 {
    30
}

fn default_surface_after() -> u32 {
    5
}

pub fn load_settings(path: &Path) -> Result<Config, serde_yaml::Error> {
    // Open the YAML file
    let file = File::open(path);
    let file = match file {
        Ok(file) => file,
        Err(err) => {
            error!("Error: {}", err);

            // Capture and print the backtrace
            let backtrace = Backtrace::new();
            error!("Backtrace:\n{:?}", backtrace);
            panic!("Cannot find settings")
        }
    };

    let reader = BufReader::new(file);

    // Parse the YAML file into the Config struct
    let config_result = serde_yaml::from_reader(reader);
    let config: Config = match config_result {
        Ok(config) => config,
        Err(err) => {
            error!("Error: {}", err);

            // Capture and print the backtrace
            let backtrace = Backtrace::new();
            error!("Backtrace:\n{:?}", backtrace);
            panic!("Cannot deserialize settings")
        }
    };

    Ok(config)
}

/// Live application settings shared with the classification stage.
///
/// The stage re-reads this on every classify call, so a settings update
/// takes effect without restarting any account engine.
pub struct SettingsStore {
    inner: RwLock<AppSettings>,
}

impl SettingsStore {
    pub fn new(settings: AppSettings) -> Self {
        SettingsStore {
            inner: RwLock::new(settings),
        }
    }

    pub fn current(&self) -> AppSettings {
        self.inner.read().expect("settings lock poisoned").clone()
    }

    pub fn update(&self, settings: AppSettings) {
        *self.inner.write().expect("settings lock poisoned") = settings;
    }
}
