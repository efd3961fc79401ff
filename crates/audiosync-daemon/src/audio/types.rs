// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Typed records for audio server objects: sinks, modules, sink inputs.

use std::collections::{BTreeMap, BTreeSet};

/// Latency assumed for a loopback module loaded without `latency_msec`.
pub const DEFAULT_LOOPBACK_LATENCY_MS: u32 = 10;

/// An audio output endpoint as enumerated by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkRecord {
    /// Server-assigned index. Not stable across restarts.
    pub id: u32,
    /// Persistent sink name (e.g. `alsa_output.pci-0000_00_1f.3.analog-stereo`).
    pub name: String,
    pub description: String,
    /// True for monitor-only sinks that must never receive a loopback.
    pub is_monitor: bool,
    pub owner_module: Option<u32>,
    /// Latency the server reports for the sink, in milliseconds.
    pub latency_ms: Option<u32>,
    pub properties: BTreeMap<String, String>,
}

impl SinkRecord {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            description: String::new(),
            is_monitor: false,
            owner_module: None,
            latency_ms: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn display_name(&self) -> &str {
        if !self.description.is_empty() {
            &self.description
        } else {
            &self.name
        }
    }
}

/// Name of the monitor source that taps everything played to `sink_name`.
pub fn monitor_of(sink_name: &str) -> String {
    format!("{}.monitor", sink_name)
}

/// Kind of a loaded server module.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    NullSink,
    Loopback,
    LadspaSink,
    Other(String),
}

impl ModuleKind {
    pub fn from_name(s: &str) -> Self {
        match s {
            "module-null-sink" => Self::NullSink,
            "module-loopback" => Self::Loopback,
            "module-ladspa-sink" => Self::LadspaSink,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::NullSink => "module-null-sink",
            Self::Loopback => "module-loopback",
            Self::LadspaSink => "module-ladspa-sink",
            Self::Other(s) => s,
        }
    }
}

/// Parsed `key=value` module arguments.
///
/// Values may be double-quoted (`sink_properties=device.description="Audio Master"`);
/// quotes are stripped and spaces inside them preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleArgs(BTreeMap<String, String>);

impl ModuleArgs {
    pub fn parse(raw: &str) -> Self {
        let mut args = BTreeMap::new();
        for token in split_args(raw) {
            if let Some((key, value)) = token.split_once('=') {
                args.insert(key.to_string(), value.replace('"', ""));
            }
        }
        Self(args)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn split_args(raw: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in raw.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// A loaded server module.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleRecord {
    pub id: u32,
    pub kind: ModuleKind,
    pub args: ModuleArgs,
}

impl ModuleRecord {
    pub fn new(id: u32, kind: ModuleKind, args: &str) -> Self {
        Self {
            id,
            kind,
            args: ModuleArgs::parse(args),
        }
    }

    pub fn is_loopback(&self) -> bool {
        self.kind == ModuleKind::Loopback
    }

    /// Source argument of a loopback module.
    pub fn loopback_source(&self) -> Option<&str> {
        if self.is_loopback() {
            self.args.get("source")
        } else {
            None
        }
    }

    /// Target sink argument of a loopback module.
    pub fn loopback_target(&self) -> Option<&str> {
        if self.is_loopback() {
            self.args.get("sink")
        } else {
            None
        }
    }

    /// Configured loopback latency, falling back to the module default.
    pub fn loopback_latency_ms(&self) -> u32 {
        self.args
            .get("latency_msec")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_LOOPBACK_LATENCY_MS)
    }

    /// Name of the sink this module provides (null and LADSPA sinks).
    pub fn provided_sink(&self) -> Option<&str> {
        match self.kind {
            ModuleKind::NullSink | ModuleKind::LadspaSink => self.args.get("sink_name"),
            _ => None,
        }
    }
}

/// An application stream currently playing into a sink.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SinkInputRecord {
    pub id: u32,
    pub sink: Option<u32>,
    pub owner_module: Option<u32>,
    pub driver: Option<String>,
    pub app_name: Option<String>,
    pub media_name: Option<String>,
}

impl SinkInputRecord {
    /// Whether the stream belongs to routing plumbing (loopbacks, LADSPA sinks)
    /// and must stay where it is.
    pub fn is_internal(&self, loopback_modules: &BTreeSet<u32>) -> bool {
        if self
            .owner_module
            .map(|m| loopback_modules.contains(&m))
            .unwrap_or(false)
        {
            return true;
        }
        if self
            .driver
            .as_deref()
            .map(|d| d.contains("module-loopback"))
            .unwrap_or(false)
        {
            return true;
        }
        if matches!(
            self.app_name.as_deref(),
            Some("module-loopback") | Some("module-ladspa-sink")
        ) {
            return true;
        }
        self.media_name
            .as_deref()
            .map(|m| m.contains("Loopback"))
            .unwrap_or(false)
    }
}

/// Supported PulseAudio-protocol server families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerFamily {
    PulseAudio,
    PipeWire,
}

impl ServerFamily {
    /// Detect the family from the `Server Name:` line of `pactl info`.
    pub fn from_server_name(name: &str) -> Self {
        if name.to_lowercase().contains("pipewire") {
            Self::PipeWire
        } else {
            Self::PulseAudio
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PulseAudio => "pulseaudio",
            Self::PipeWire => "pipewire",
        }
    }
}

/// Result of `pactl info`.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerInfo {
    pub server_name: String,
    pub server_version: String,
    pub default_sink: Option<String>,
    pub family: ServerFamily,
}

/// Index of a module loaded by a mutating call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleHandle(pub u32);
