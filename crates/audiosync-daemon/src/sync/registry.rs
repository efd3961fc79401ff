// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Known devices: persisted settings plus live presence.
//!
//! The registry never stores routing state; edges are always re-queried.

use crate::config::{DelayDefaults, DeviceConfig};
use crate::sync::classify::{clamp_delay, DeviceClass, DeviceKey, DiscoveredDevice};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEntry {
    pub key: DeviceKey,
    /// `None` until the device has been enumerated in this session.
    pub class: Option<DeviceClass>,
    pub name: String,
    pub delay_override: Option<u32>,
    pub enabled: bool,
    /// Unix seconds.
    pub last_seen: u64,
    pub present: bool,
    /// Current sink, while present.
    pub sink_name: Option<String>,
    pub reported_latency_ms: Option<u32>,
    absent_since: Option<Instant>,
}

impl DeviceEntry {
    fn from_config(key: DeviceKey, config: &DeviceConfig) -> Self {
        Self {
            key,
            class: None,
            name: config.name.clone(),
            delay_override: config.delay_ms.map(clamp_delay),
            enabled: config.enabled,
            last_seen: config.last_seen,
            present: false,
            sink_name: None,
            reported_latency_ms: None,
            absent_since: None,
        }
    }

    fn to_config(&self) -> DeviceConfig {
        DeviceConfig {
            name: self.name.clone(),
            delay_ms: self.delay_override,
            enabled: self.enabled,
            last_seen: self.last_seen,
        }
    }

    /// Configured delay, falling back to the class default.
    pub fn delay_ms(&self, defaults: &DelayDefaults) -> u32 {
        self.delay_override
            .unwrap_or_else(|| defaults.for_class(self.class.unwrap_or(DeviceClass::Other)))
    }

    /// Whether an absent device is still inside the grace window.
    pub fn within_grace(&self, grace: Duration, now: Instant) -> bool {
        match self.absent_since {
            Some(since) => now.saturating_duration_since(since) < grace,
            None => false,
        }
    }
}

/// Presence changes found by one enumeration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceDelta {
    pub appeared: BTreeSet<DeviceKey>,
    pub disappeared: BTreeSet<DeviceKey>,
    /// Keys seen for the first time ever.
    pub new_devices: BTreeSet<DeviceKey>,
    /// Keys whose sink name changed (e.g. a profile switch).
    pub moved: BTreeSet<DeviceKey>,
}

impl PresenceDelta {
    pub fn is_empty(&self) -> bool {
        self.appeared.is_empty() && self.disappeared.is_empty() && self.moved.is_empty()
    }

    pub fn keys(&self) -> BTreeSet<DeviceKey> {
        self.appeared
            .iter()
            .chain(&self.disappeared)
            .chain(&self.moved)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    devices: BTreeMap<DeviceKey, DeviceEntry>,
    dirty: bool,
}

impl Registry {
    pub fn from_config(devices: &BTreeMap<String, DeviceConfig>) -> Self {
        let devices = devices
            .iter()
            .map(|(key, config)| {
                let key = DeviceKey::new(key.as_str());
                (key.clone(), DeviceEntry::from_config(key, config))
            })
            .collect();
        Self {
            devices,
            dirty: false,
        }
    }

    pub fn to_config(&self) -> BTreeMap<String, DeviceConfig> {
        self.devices
            .iter()
            .map(|(key, entry)| (key.to_string(), entry.to_config()))
            .collect()
    }

    /// Whether persisted fields changed since the last `take_dirty`.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn get(&self, key: &DeviceKey) -> Option<&DeviceEntry> {
        self.devices.get(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = &DeviceEntry> {
        self.devices.values()
    }

    /// Present devices and the sink each one currently uses.
    pub fn present_sinks(&self) -> BTreeMap<DeviceKey, String> {
        self.devices
            .values()
            .filter_map(|d| match (&d.sink_name, d.present) {
                (Some(sink), true) => Some((d.key.clone(), sink.clone())),
                _ => None,
            })
            .collect()
    }

    /// Key of the present device currently using `sink_name`.
    pub fn key_for_sink(&self, sink_name: &str) -> Option<&DeviceKey> {
        self.devices
            .values()
            .find(|d| d.present && d.sink_name.as_deref() == Some(sink_name))
            .map(|d| &d.key)
    }

    /// Record an enumeration: mark discovered devices present (creating
    /// entries for new ones) and every other known device absent.
    pub fn observe(&mut self, discovered: &[DiscoveredDevice], now: Instant) -> PresenceDelta {
        let mut delta = PresenceDelta::default();
        let seen_at = unix_now();
        let seen: BTreeSet<&DeviceKey> = discovered.iter().map(|d| &d.key).collect();

        for device in discovered {
            let entry = self.devices.entry(device.key.clone()).or_insert_with(|| {
                info!(
                    "New device {} ({}, {})",
                    device.display_name, device.key, device.class
                );
                delta.new_devices.insert(device.key.clone());
                DeviceEntry {
                    key: device.key.clone(),
                    class: Some(device.class),
                    name: device.display_name.clone(),
                    delay_override: None,
                    enabled: device.class.enabled_by_default(),
                    last_seen: 0,
                    present: false,
                    sink_name: None,
                    reported_latency_ms: None,
                    absent_since: None,
                }
            });

            if !entry.present {
                delta.appeared.insert(device.key.clone());
                // Last-seen is persisted on arrival and departure only.
                entry.last_seen = seen_at;
                self.dirty = true;
            } else if entry.sink_name.as_deref() != Some(device.sink_name.as_str()) {
                delta.moved.insert(device.key.clone());
            }
            if entry.name.is_empty() || entry.name != device.display_name {
                entry.name = device.display_name.clone();
                self.dirty = true;
            }

            entry.class = Some(device.class);
            entry.present = true;
            entry.absent_since = None;
            entry.sink_name = Some(device.sink_name.clone());
            entry.reported_latency_ms = device.reported_latency_ms;
        }

        for entry in self.devices.values_mut() {
            if entry.present && !seen.contains(&entry.key) {
                debug!("Device {} is absent", entry.key);
                delta.disappeared.insert(entry.key.clone());
                entry.present = false;
                entry.absent_since = Some(now);
                entry.last_seen = seen_at;
                entry.sink_name = None;
                self.dirty = true;
            }
        }

        delta
    }

    pub fn set_delay(&mut self, key: &DeviceKey, delay_ms: u32) -> Option<u32> {
        let entry = self.devices.get_mut(key)?;
        let delay = clamp_delay(delay_ms);
        if entry.delay_override != Some(delay) {
            entry.delay_override = Some(delay);
            self.dirty = true;
        }
        Some(delay)
    }

    pub fn set_enabled(&mut self, key: &DeviceKey, enabled: bool) -> bool {
        match self.devices.get_mut(key) {
            Some(entry) => {
                if entry.enabled != enabled {
                    entry.enabled = enabled;
                    self.dirty = true;
                }
                true
            }
            None => false,
        }
    }

    /// Forget absent devices. With `older_than`, only those unseen for at least
    /// that long (by persisted last-seen); otherwise every absent device.
    pub fn purge_absent(&mut self, older_than: Option<Duration>) -> Vec<DeviceKey> {
        let now = unix_now();
        let purged: Vec<DeviceKey> = self
            .devices
            .values()
            .filter(|d| !d.present)
            .filter(|d| match older_than {
                Some(age) => now.saturating_sub(d.last_seen) >= age.as_secs(),
                None => true,
            })
            .map(|d| d.key.clone())
            .collect();

        for key in &purged {
            info!("Forgetting absent device {}", key);
            self.devices.remove(key);
        }
        if !purged.is_empty() {
            self.dirty = true;
        }
        purged
    }
}
