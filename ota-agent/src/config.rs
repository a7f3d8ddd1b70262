//! Agent configuration.
//!
//! Real configuration loading (how settings reach the device -- provisioning,
//! a config server, a local file) is an out-of-scope collaborator per the
//! system's purpose and scope; what's left here is the ambient slice every
//! `tachtalk-firmware`-style binary still carries regardless: a log level and
//! a handful of named constants, persisted the same way the teacher's
//! `config.rs` persists its `Config` blob (`serde_json` into one NVS key),
//! just trimmed to this agent's shape instead of WiFi/OBD2/LED settings.

use anyhow::{anyhow, Result};
use log::{debug, info, warn, LevelFilter};
use serde::{Deserialize, Serialize};

use crate::settings::SettingsStore;

const CONFIG_NAMESPACE: &str = "agent";
const CONFIG_KEY: &str = "config";

/// Configurable log level, mirroring the teacher's own `LogLevel`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    #[must_use]
    pub const fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Off => LevelFilter::Off,
            Self::Error => LevelFilter::Error,
            Self::Warn => LevelFilter::Warn,
            Self::Info => LevelFilter::Info,
            Self::Debug => LevelFilter::Debug,
        }
    }
}

/// Ambient agent configuration: everything the core needs that isn't part of
/// the OTA state machine itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub log_level: LogLevel,
    /// How often the telemetry client's polling loop runs, per the
    /// concurrency model's "~100ms cadence".
    #[serde(default = "default_telemetry_poll_ms")]
    pub telemetry_poll_ms: u64,
    /// How often the agent task's periodic publishers run, per the
    /// concurrency model's "~500ms cadence".
    #[serde(default = "default_publish_interval_ms")]
    pub publish_interval_ms: u64,
}

const fn default_telemetry_poll_ms() -> u64 {
    100
}

const fn default_publish_interval_ms() -> u64 {
    500
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            telemetry_poll_ms: default_telemetry_poll_ms(),
            publish_interval_ms: default_publish_interval_ms(),
        }
    }
}

impl AgentConfig {
    pub fn load_or_default(settings: &dyn SettingsStore) -> Self {
        match Self::load(settings) {
            Ok(config) => {
                info!("config: loaded from NVS");
                config
            }
            Err(e) => {
                warn!("config: failed to load from NVS: {e}, using defaults");
                Self::default()
            }
        }
    }

    fn load(settings: &dyn SettingsStore) -> Result<Self> {
        debug!("config: loading from NVS");
        let mut bytes = None;
        settings.load(CONFIG_NAMESPACE, &mut |key, value| {
            if key == CONFIG_KEY {
                bytes = Some(value.to_vec());
            }
            true
        })?;
        let bytes = bytes.ok_or_else(|| anyhow!("no config found in NVS"))?;
        serde_json::from_slice(&bytes).map_err(|e| anyhow!("config: malformed JSON: {e}"))
    }

    pub fn save(&self, settings: &dyn SettingsStore) -> Result<()> {
        let json = serde_json::to_vec(self)?;
        settings.save(CONFIG_NAMESPACE, CONFIG_KEY, &json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MemSettingsStore;

    #[test]
    fn save_then_load_round_trips() {
        let store = MemSettingsStore::default();
        let config = AgentConfig {
            log_level: LogLevel::Debug,
            telemetry_poll_ms: 250,
            publish_interval_ms: 1000,
        };
        config.save(&store).unwrap();
        let loaded = AgentConfig::load(&store).unwrap();
        assert_eq!(loaded.log_level, LogLevel::Debug);
        assert_eq!(loaded.telemetry_poll_ms, 250);
    }

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let store = MemSettingsStore::default();
        let config = AgentConfig::load_or_default(&store);
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.publish_interval_ms, 500);
    }
}
