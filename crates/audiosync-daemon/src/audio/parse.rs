// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Parsers for `pactl` text output.
//!
//! Both PulseAudio and pipewire-pulse print the same block layout, with small
//! differences: pipewire-pulse reports `Owner Module: n/a` (or `4294967295`)
//! for sinks it does not own through a module, quotes module arguments more
//! often, and omits the `configured` part of the `Latency:` line.

use crate::audio::types::{
    ModuleKind, ModuleRecord, ServerFamily, ServerInfo, SinkInputRecord, SinkRecord,
};
use regex::Regex;
use std::sync::LazyLock;

static LATENCY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Latency:\s+(\d+)(?:\.\d+)?\s+usec").expect("valid regex"));

static PROPERTY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^([A-Za-z0-9_.\-]+)\s+=\s+"(.*)"$"#).expect("valid regex"));

/// Parse `pactl info`.
pub fn parse_server_info(output: &str) -> Option<ServerInfo> {
    let mut server_name = None;
    let mut server_version = String::new();
    let mut default_sink = None;

    for line in output.lines().map(str::trim) {
        if let Some(v) = line.strip_prefix("Server Name:") {
            server_name = Some(v.trim().to_string());
        } else if let Some(v) = line.strip_prefix("Server Version:") {
            server_version = v.trim().to_string();
        } else if let Some(v) = line.strip_prefix("Default Sink:") {
            let v = v.trim();
            if !v.is_empty() && v != "@DEFAULT_SINK@" {
                default_sink = Some(v.to_string());
            }
        }
    }

    let server_name = server_name?;
    Some(ServerInfo {
        family: ServerFamily::from_server_name(&server_name),
        server_name,
        server_version,
        default_sink,
    })
}

/// Split long-format output into blocks that start with `header` (e.g. `Sink #`).
/// Returns `(index, body_lines)` pairs.
fn blocks<'a>(output: &'a str, header: &str) -> Vec<(u32, Vec<&'a str>)> {
    let mut result: Vec<(u32, Vec<&str>)> = Vec::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix(header) {
            if let Ok(id) = rest.trim().parse::<u32>() {
                result.push((id, Vec::new()));
                continue;
            }
        }
        if let Some((_, body)) = result.last_mut() {
            body.push(trimmed);
        }
    }
    result
}

fn parse_module_ref(value: &str) -> Option<u32> {
    match value.trim().parse::<u32>() {
        Ok(u32::MAX) | Err(_) => None,
        Ok(id) => Some(id),
    }
}

/// Parse `pactl list sinks` (long format).
pub fn parse_sinks(output: &str) -> Vec<SinkRecord> {
    let mut sinks = Vec::new();

    for (id, lines) in blocks(output, "Sink #") {
        let mut sink = SinkRecord::new(id, "");
        let mut in_properties = false;

        for line in lines {
            if line == "Properties:" {
                in_properties = true;
                continue;
            }
            if in_properties {
                if let Some(caps) = PROPERTY_RE.captures(line) {
                    sink.properties.insert(caps[1].to_string(), caps[2].to_string());
                    continue;
                }
                // Property section ends at the next `Key: value` field.
                if line.contains(':') {
                    in_properties = false;
                } else {
                    continue;
                }
            }

            if let Some(v) = line.strip_prefix("Name:") {
                sink.name = v.trim().to_string();
            } else if let Some(v) = line.strip_prefix("Description:") {
                sink.description = v.trim().to_string();
            } else if let Some(v) = line.strip_prefix("Owner Module:") {
                sink.owner_module = parse_module_ref(v);
            } else if let Some(caps) = LATENCY_RE.captures(line) {
                sink.latency_ms = caps[1].parse::<u64>().ok().map(|usec| (usec / 1000) as u32);
            }
        }

        if sink.name.is_empty() {
            continue;
        }
        sink.is_monitor =
            sink.name.ends_with(".monitor") || sink.property("device.class") == Some("monitor");
        sinks.push(sink);
    }

    sinks
}

/// Parse `pactl list short modules` (`id<TAB>name<TAB>args`).
pub fn parse_short_modules(output: &str) -> Vec<ModuleRecord> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '\t');
            let id = parts.next()?.trim().parse::<u32>().ok()?;
            let name = parts.next()?.trim();
            let args = parts.next().unwrap_or("").trim();
            Some(ModuleRecord::new(id, ModuleKind::from_name(name), args))
        })
        .collect()
}

/// Parse `pactl list sink-inputs` (long format).
pub fn parse_sink_inputs(output: &str) -> Vec<SinkInputRecord> {
    blocks(output, "Sink Input #")
        .into_iter()
        .map(|(id, lines)| {
            let mut input = SinkInputRecord {
                id,
                ..Default::default()
            };
            for line in lines {
                if let Some(v) = line.strip_prefix("Owner Module:") {
                    input.owner_module = parse_module_ref(v);
                } else if let Some(v) = line.strip_prefix("Driver:") {
                    input.driver = Some(v.trim().to_string());
                } else if let Some(v) = line.strip_prefix("Sink:") {
                    input.sink = v.trim().parse().ok();
                } else if let Some(caps) = PROPERTY_RE.captures(line) {
                    match &caps[1] {
                        "application.name" => input.app_name = Some(caps[2].to_string()),
                        "media.name" => input.media_name = Some(caps[2].to_string()),
                        _ => {}
                    }
                }
            }
            input
        })
        .collect()
}

/// Parse the module index printed by `pactl load-module`.
pub fn parse_module_index(output: &str) -> Option<u32> {
    output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .and_then(|l| l.parse().ok())
}
