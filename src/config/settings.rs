/*
* Provisioning Core Configuration
* -------------------------------
*
* Configuration Hierarchy (from lowest to highest priority):
* 1. Hardcoded defaults
* 2. default.* (base configuration, any format the config crate recognises)
* 3. local.* (environment-specific, optional, same formats)
* 4. Environment variables, prefix APP and `__` as section separator
*    (APP__BACKEND__FAKE=true)
*
* Sections:
* - backend: the control program invoked for VM lifecycle verbs, fake mode
*   switch, simulated latency, worker pool size and async notify endpoint.
*   The control program path is read once here and handed to the executor
*   at construction; nothing re-reads it later.
* - network: directory of per-network pool files and the MAC prefix.
* - limits: request admission bounds.
*/

use config::{Config, ConfigError, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub backend: BackendSettings,
    pub network: NetworkSettings,
    #[serde(default)]
    pub limits: LimitSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    pub control_program: PathBuf,
    pub fake: bool,
    #[serde(default)]
    pub fake_lag_ms: u64,
    pub workers: usize,
    #[serde(default)]
    pub notify_endpoint: Option<String>,
}

impl BackendSettings {
    pub fn fake_lag(&self) -> Option<Duration> {
        (self.fake_lag_ms > 0).then(|| Duration::from_millis(self.fake_lag_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub config_dir: PathBuf,
    pub mac_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    pub max_instances: u16,
    pub max_memory_mb: u64,
    pub max_vcpus: u32,
    pub max_path_len: usize,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_instances: 32,
            max_memory_mb: 65536,
            max_vcpus: 32,
            max_path_len: 512,
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = std::env::var("CONFIG_PATH")
            .unwrap_or_else(|_| "config".to_string());
        Self::from_dir(&config_path)
    }

    /// Layer `<dir>/default` and `<dir>/local` over the built-in defaults.
    pub fn from_dir(config_path: &str) -> Result<Self, ConfigError> {
        info!("Loading configuration from path: {}", config_path);

        let config = Config::builder()
            // Start with default settings
            .set_default("backend.control_program", "/opt/vmm/bin/control")?
            .set_default("backend.fake", false)?
            .set_default("backend.fake_lag_ms", 0)?
            .set_default("backend.workers", 4)?
            .set_default("network.config_dir", "/etc/vm-provision/networks")?
            .set_default("network.mac_prefix", "A2:AA:BB")?

            // Add configuration from files
            .add_source(File::with_name(&format!("{}/default", config_path)).required(false))
            .add_source(File::with_name(&format!("{}/local", config_path)).required(false))

            // Add environment variables with prefix "APP"
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        config.try_deserialize()
    }
}

pub fn generate_default_config() -> Settings {
    Settings {
        backend: BackendSettings {
            control_program: PathBuf::from("/opt/vmm/bin/control"),
            fake: true,
            fake_lag_ms: 0,
            workers: 4,
            notify_endpoint: None,
        },
        network: NetworkSettings {
            config_dir: PathBuf::from("/etc/vm-provision/networks"),
            mac_prefix: "A2:AA:BB".to_string(),
        },
        limits: LimitSettings::default(),
    }
}
