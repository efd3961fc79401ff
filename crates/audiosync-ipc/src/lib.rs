// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Shared IPC types and D-Bus interface definitions for AudioSync.
//!
//! This crate defines the communication protocol between the AudioSync daemon
//! (the synchronization engine) and its clients via D-Bus.

use serde::{Deserialize, Serialize};
use zbus::zvariant::Type;

/// D-Bus service name for the AudioSync daemon.
pub const DBUS_NAME: &str = "com.audiosync.Daemon";

/// D-Bus object path for the main daemon interface.
pub const DBUS_PATH: &str = "/com/audiosync/Daemon";

/// D-Bus interface name.
pub const DBUS_INTERFACE: &str = "com.audiosync.Daemon";

/// Verified per-device state as last observed on the audio server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Type)]
pub struct DeviceInfo {
    /// Stable device key (e.g. `bt:aa:bb:cc:dd:ee:ff`).
    pub key: String,
    /// Human-readable name.
    pub name: String,
    /// Sink name on the audio server (empty when the device is absent).
    pub sink_name: String,
    /// Device class: "analog", "usb", "bluetooth" or "other".
    pub class: String,
    /// Whether the device's sink is currently enumerated.
    pub present: bool,
    /// Whether the user wants this device in the sync group.
    pub enabled: bool,
    /// Whether a single loopback with the configured delay was verified.
    pub synced: bool,
    /// Configured compensation delay in milliseconds.
    pub delay_ms: u32,
    /// Latency reported by the server for the sink, -1 if unknown.
    pub reported_latency_ms: i32,
    /// Short outcome text ("synced", "not synced (loopback rejected)", ...).
    pub status: String,
}

impl DeviceInfo {
    /// Get the display name for the device.
    pub fn display_name(&self) -> &str {
        if !self.name.is_empty() {
            &self.name
        } else {
            &self.key
        }
    }

    /// One-line, per-device summary suitable for user display.
    pub fn summary(&self) -> String {
        format!("{}: {}", self.display_name(), self.status)
    }
}

/// Snapshot of the engine as exposed to clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Type)]
pub struct EngineStatus {
    /// "healthy", "suspect" or "resetting".
    pub health: String,
    /// Reason the engine is suspect (empty when healthy).
    pub health_reason: String,
    /// Whether the audio server answered the last query.
    pub server_available: bool,
    /// Server name as reported by the server (empty if unknown).
    pub server_name: String,
    /// Whether the master sink exists.
    pub master_present: bool,
    /// Whether the routing head is the default sink.
    pub master_is_default: bool,
    /// Monitor source the loopbacks read from.
    pub routing_source: String,
    /// False after cleanup until the next sync-all.
    pub sync_active: bool,
    /// Last error message (empty if none).
    pub last_error: String,
    /// Per-device verified state.
    pub devices: Vec<DeviceInfo>,
}

impl EngineStatus {
    /// Number of present, enabled devices that are verified in sync.
    pub fn synced_count(&self) -> usize {
        self.devices.iter().filter(|d| d.synced).count()
    }

    /// Present, enabled devices that failed verification.
    pub fn unsynced(&self) -> impl Iterator<Item = &DeviceInfo> {
        self.devices
            .iter()
            .filter(|d| d.present && d.enabled && !d.synced)
    }

    /// Find a device by key.
    pub fn device(&self, key: &str) -> Option<&DeviceInfo> {
        self.devices.iter().find(|d| d.key == key)
    }
}

/// Error types for daemon operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DaemonError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
    #[error("Audio server not running: {0}")]
    ServerUnavailable(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<DaemonError> for zbus::fdo::Error {
    fn from(e: DaemonError) -> Self {
        match e {
            DaemonError::InvalidArgument(msg) => zbus::fdo::Error::InvalidArgs(msg),
            other => zbus::fdo::Error::Failed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(key: &str, name: &str, synced: bool) -> DeviceInfo {
        DeviceInfo {
            key: key.to_string(),
            name: name.to_string(),
            sink_name: String::new(),
            class: "analog".to_string(),
            present: true,
            enabled: true,
            synced,
            delay_ms: 121,
            reported_latency_ms: -1,
            status: if synced { "synced".into() } else { "not synced".into() },
        }
    }

    #[test]
    fn test_summary_is_per_device() {
        let d = device("alsa:pci-0000_00_1f.3.analog-stereo", "Analog Card 2", false);
        assert_eq!(d.summary(), "Analog Card 2: not synced");
    }

    #[test]
    fn test_display_name_falls_back_to_key() {
        let d = device("bt:aa:bb", "", true);
        assert_eq!(d.display_name(), "bt:aa:bb");
    }

    #[test]
    fn test_status_counts() {
        let status = EngineStatus {
            devices: vec![device("a", "A", true), device("b", "B", false)],
            ..Default::default()
        };
        assert_eq!(status.synced_count(), 1);
        assert_eq!(status.unsynced().count(), 1);
        assert!(status.device("b").is_some());
        assert!(status.device("c").is_none());
    }

    #[test]
    fn test_invalid_argument_maps_to_invalid_args() {
        let err: zbus::fdo::Error = DaemonError::InvalidArgument("bad".into()).into();
        assert!(matches!(err, zbus::fdo::Error::InvalidArgs(_)));
    }
}
