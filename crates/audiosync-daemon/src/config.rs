// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Configuration management for the daemon.

use crate::audio::types::ServerFamily;
use crate::sync::classify::{clamp_delay, DeviceClass};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const CONFIG_FILE: &str = "sync.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("No config directory found")]
    NoConfigDir,
}

/// Default compensation delay per device class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayDefaults {
    #[serde(default = "default_wired_delay")]
    pub analog_ms: u32,
    #[serde(default = "default_wired_delay")]
    pub usb_ms: u32,
    #[serde(default = "default_bluetooth_delay")]
    pub bluetooth_ms: u32,
    #[serde(default = "default_wired_delay")]
    pub other_ms: u32,
}

fn default_wired_delay() -> u32 {
    121
}

fn default_bluetooth_delay() -> u32 {
    1
}

impl Default for DelayDefaults {
    fn default() -> Self {
        Self {
            analog_ms: default_wired_delay(),
            usb_ms: default_wired_delay(),
            bluetooth_ms: default_bluetooth_delay(),
            other_ms: default_wired_delay(),
        }
    }
}

impl DelayDefaults {
    pub fn for_class(&self, class: DeviceClass) -> u32 {
        let ms = match class {
            DeviceClass::Analog => self.analog_ms,
            DeviceClass::Usb => self.usb_ms,
            DeviceClass::Bluetooth => self.bluetooth_ms,
            DeviceClass::Other => self.other_ms,
        };
        clamp_delay(ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// How long an absent device keeps its loopback before it is torn down.
    #[serde(default = "default_absent_grace_ms")]
    pub absent_grace_ms: u64,
    /// Absent devices unseen for this long are forgotten. 0 disables purging.
    #[serde(default = "default_purge_after_days")]
    pub purge_after_days: u64,
}

fn default_interval_ms() -> u64 {
    3000
}

fn default_absent_grace_ms() -> u64 {
    5000
}

fn default_purge_after_days() -> u64 {
    30
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            absent_grace_ms: default_absent_grace_ms(),
            purge_after_days: default_purge_after_days(),
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(100))
    }

    pub fn absent_grace(&self) -> Duration {
        Duration::from_millis(self.absent_grace_ms)
    }

    pub fn purge_after(&self) -> Option<Duration> {
        (self.purge_after_days > 0).then(|| Duration::from_secs(self.purge_after_days * 86_400))
    }
}

/// Server family selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FamilySetting {
    #[default]
    Auto,
    PulseAudio,
    PipeWire,
}

impl FamilySetting {
    pub fn family_override(&self) -> Option<ServerFamily> {
        match self {
            Self::Auto => None,
            Self::PulseAudio => Some(ServerFamily::PulseAudio),
            Self::PipeWire => Some(ServerFamily::PipeWire),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default)]
    pub family: FamilySetting,
    /// Clears WirePlumber's cached module references on reset.
    #[serde(default = "default_state_reset_command")]
    pub state_reset_command: Vec<String>,
}

fn default_command_timeout_ms() -> u64 {
    5000
}

fn default_state_reset_command() -> Vec<String> {
    ["systemctl", "--user", "restart", "wireplumber"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: default_command_timeout_ms(),
            family: FamilySetting::default(),
            state_reset_command: default_state_reset_command(),
        }
    }
}

impl ServerConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms.max(100))
    }
}

/// Persisted per-device settings, keyed by device key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub name: String,
    /// Per-device override of the class default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u32>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Unix seconds.
    #[serde(default)]
    pub last_seen: u64,
}

fn default_true() -> bool {
    true
}

fn default_master_sink() -> String {
    "audio_master".to_string()
}

fn default_eq_sink() -> String {
    "eq_sink".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_master_sink")]
    pub master_sink: String,
    #[serde(default = "default_eq_sink")]
    pub eq_sink: String,
    #[serde(default)]
    pub eq_enabled: bool,
    /// Move application streams onto the routing head after (re)creating it.
    #[serde(default = "default_true")]
    pub move_streams: bool,
    /// Unmute and raise newly attached Bluetooth sinks to 100%.
    #[serde(default = "default_true")]
    pub prepare_bluetooth: bool,
    /// Tear down the routing graph when the daemon exits.
    #[serde(default)]
    pub cleanup_on_exit: bool,
    #[serde(default)]
    pub delays: DelayDefaults,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            master_sink: default_master_sink(),
            eq_sink: default_eq_sink(),
            eq_enabled: false,
            move_streams: true,
            prepare_bluetooth: true,
            cleanup_on_exit: false,
            delays: DelayDefaults::default(),
            monitor: MonitorConfig::default(),
            server: ServerConfig::default(),
            devices: BTreeMap::new(),
        }
    }
}

impl SyncConfig {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// Configuration manager handles loading and saving config files.
pub struct ConfigManager {
    config_dir: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager.
    pub fn new() -> Result<Self, ConfigError> {
        let config_dir = directories::ProjectDirs::from("com", "audiosync", "audiosync")
            .map(|d| d.config_dir().to_path_buf())
            .ok_or(ConfigError::NoConfigDir)?;
        Self::with_dir(config_dir)
    }

    /// Use an explicit config directory.
    pub fn with_dir(config_dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref().to_path_buf();
        fs::create_dir_all(&config_dir)?;
        debug!("Config directory: {:?}", config_dir);
        Ok(Self { config_dir })
    }

    fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    /// Load sync configuration; a missing file yields defaults.
    pub fn load(&self) -> Result<SyncConfig, ConfigError> {
        let path = self.config_path();
        if !path.exists() {
            debug!("No sync config found, using defaults");
            return Ok(SyncConfig::default());
        }

        let content = fs::read_to_string(&path)?;
        let config = SyncConfig::from_toml(&content)?;
        info!(
            "Loaded sync config from {:?} ({} known devices)",
            path,
            config.devices.len()
        );
        Ok(config)
    }

    /// Save sync configuration.
    pub fn save(&self, config: &SyncConfig) -> Result<(), ConfigError> {
        let path = self.config_path();
        let content = config.to_toml()?;
        // Atomic replace.
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &path)?;
        debug!("Saved sync config to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.master_sink, "audio_master");
        assert_eq!(config.delays.for_class(DeviceClass::Analog), 121);
        assert_eq!(config.delays.for_class(DeviceClass::Bluetooth), 1);
        assert_eq!(config.monitor.interval(), Duration::from_secs(3));
        assert_eq!(config.server.command_timeout(), Duration::from_secs(5));
        assert_eq!(config.server.state_reset_command[0], "systemctl");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = SyncConfig::from_toml(
            r#"
eq_enabled = true

[delays]
analog_ms = 900

[server]
family = "pipewire"

[devices."bt:aa:bb:cc:dd:ee:ff"]
name = "JBL Flip"
delay_ms = 3
"#,
        )
        .unwrap();
        assert!(config.eq_enabled);
        assert_eq!(config.delays.for_class(DeviceClass::Analog), 500);
        assert_eq!(config.delays.usb_ms, 121);
        assert_eq!(config.server.family.family_override(), Some(ServerFamily::PipeWire));
        let dev = &config.devices["bt:aa:bb:cc:dd:ee:ff"];
        assert_eq!(dev.delay_ms, Some(3));
        assert!(dev.enabled);
    }

    #[test]
    fn test_purge_disabled_at_zero() {
        let monitor = MonitorConfig {
            purge_after_days: 0,
            ..Default::default()
        };
        assert!(monitor.purge_after().is_none());
        assert_eq!(
            MonitorConfig::default().purge_after(),
            Some(Duration::from_secs(30 * 86_400))
        );
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_dir(dir.path()).unwrap();
        assert_eq!(manager.load().unwrap(), SyncConfig::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_dir(dir.path().join("nested")).unwrap();

        let mut config = SyncConfig::default();
        config.devices.insert(
            "alsa:pci-0000_00_1f.3.analog-stereo".to_string(),
            DeviceConfig {
                name: "Built-in Audio".to_string(),
                delay_ms: Some(140),
                enabled: false,
                last_seen: 1_760_000_000,
            },
        );
        manager.save(&config).unwrap();

        let loaded = manager.load().unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "master_sink = [").unwrap();
        let manager = ConfigManager::with_dir(dir.path()).unwrap();
        assert!(matches!(manager.load(), Err(ConfigError::TomlParse(_))));
    }
}
