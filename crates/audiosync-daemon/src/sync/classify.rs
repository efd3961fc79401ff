// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Device identity and classification from raw sink records.

use crate::audio::types::SinkRecord;
use std::fmt;

/// Smallest delay a loopback accepts.
pub const MIN_DELAY_MS: u32 = 1;
/// Largest configurable compensation delay.
pub const MAX_DELAY_MS: u32 = 500;

pub fn clamp_delay(ms: u32) -> u32 {
    ms.clamp(MIN_DELAY_MS, MAX_DELAY_MS)
}

/// Stable device identity derived from the persistent sink name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceKey(String);

impl DeviceKey {
    /// Wrap an already normalized key (e.g. from config or a client request).
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into().trim().to_lowercase())
    }

    /// Derive the key for a sink name.
    pub fn from_sink_name(name: &str) -> Self {
        if let Some(rest) = bluetooth_rest(name) {
            return Self(format!("bt:{}", bluetooth_address(rest)));
        }
        if let Some(rest) = name.strip_prefix("alsa_output.") {
            return Self(format!("alsa:{}", rest.to_lowercase()));
        }
        Self(format!("sink:{}", name.to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn bluetooth_rest(name: &str) -> Option<&str> {
    name.strip_prefix("bluez_sink.")
        .or_else(|| name.strip_prefix("bluez_output."))
}

/// `AA_BB_CC_DD_EE_FF.a2dp_sink` -> `aa:bb:cc:dd:ee:ff`.
fn bluetooth_address(rest: &str) -> String {
    let addr = rest.split('.').next().unwrap_or(rest);
    addr.replace(['_', '-'], ":").to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    Analog,
    Usb,
    Bluetooth,
    Other,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analog => "analog",
            Self::Usb => "usb",
            Self::Bluetooth => "bluetooth",
            Self::Other => "other",
        }
    }

    /// Unrecognized sinks (network sinks, virtual devices) are opt-in.
    pub fn enabled_by_default(&self) -> bool {
        !matches!(self, Self::Other)
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Names of the engine's own sinks, which are never devices.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyContext<'a> {
    pub master_sink: &'a str,
    pub eq_sink: &'a str,
}

/// A sink recognized as a physical output device.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    pub key: DeviceKey,
    pub class: DeviceClass,
    pub sink_id: u32,
    pub sink_name: String,
    pub display_name: String,
    pub reported_latency_ms: Option<u32>,
}

pub fn is_monitor(sink: &SinkRecord) -> bool {
    sink.is_monitor
        || sink.name.ends_with(".monitor")
        || sink.property("device.class") == Some("monitor")
}

/// The master sink, renamed duplicates of it (`audio_master.2`), or the EQ sink.
fn is_engine_sink(name: &str, ctx: &ClassifyContext<'_>) -> bool {
    name == ctx.eq_sink
        || name == ctx.master_sink
        || name
            .strip_prefix(ctx.master_sink)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// Classify a sink, or `None` if it must never receive a loopback.
pub fn classify(sink: &SinkRecord, ctx: &ClassifyContext<'_>) -> Option<DiscoveredDevice> {
    if is_monitor(sink) || is_engine_sink(&sink.name, ctx) {
        return None;
    }

    let class = if bluetooth_rest(&sink.name).is_some() {
        DeviceClass::Bluetooth
    } else if let Some(rest) = sink.name.strip_prefix("alsa_output.") {
        if rest.to_lowercase().contains("usb") || sink.property("device.bus") == Some("usb") {
            DeviceClass::Usb
        } else {
            DeviceClass::Analog
        }
    } else {
        DeviceClass::Other
    };

    let key = match (class, sink.property("api.bluez5.address")) {
        (DeviceClass::Bluetooth, Some(addr)) => DeviceKey(format!("bt:{}", addr.to_lowercase())),
        _ => DeviceKey::from_sink_name(&sink.name),
    };

    Some(DiscoveredDevice {
        key,
        class,
        sink_id: sink.id,
        sink_name: sink.name.clone(),
        display_name: sink.display_name().to_string(),
        reported_latency_ms: sink.latency_ms,
    })
}

/// Classify every sink, resolving key collisions in favour of the highest
/// sink index (the most recently created one).
pub fn discover(sinks: &[SinkRecord], ctx: &ClassifyContext<'_>) -> Vec<DiscoveredDevice> {
    let mut devices: Vec<DiscoveredDevice> = Vec::new();
    for device in sinks.iter().filter_map(|s| classify(s, ctx)) {
        match devices.iter_mut().find(|d| d.key == device.key) {
            Some(existing) if device.sink_id > existing.sink_id => {
                tracing::debug!(
                    "Sink '{}' supersedes stale '{}' for {}",
                    device.sink_name,
                    existing.sink_name,
                    device.key
                );
                *existing = device;
            }
            Some(_) => {}
            None => devices.push(device),
        }
    }
    devices.sort_by(|a, b| a.key.cmp(&b.key));
    devices
}
