// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Plain-text rendering of engine status for the terminal.

use audiosync_ipc::{DeviceInfo, EngineStatus};
use std::fmt::Write;

/// Full status report: server, routing, health, then one line per device.
pub fn format_status(status: &EngineStatus) -> String {
    let mut out = String::new();

    if status.server_available {
        let _ = writeln!(out, "Server:   {}", status.server_name);
    } else {
        let _ = writeln!(out, "Server:   not running");
    }

    let routing = match (status.sync_active, status.master_present, status.master_is_default) {
        (false, _, _) => "paused (run `audiosync sync` to resume)".to_string(),
        (true, false, _) => "master sink missing".to_string(),
        (true, true, false) => format!("{} (not default output)", status.routing_source),
        (true, true, true) => status.routing_source.clone(),
    };
    let _ = writeln!(out, "Routing:  {}", routing);

    if status.health_reason.is_empty() {
        let _ = writeln!(out, "Health:   {}", status.health);
    } else {
        let _ = writeln!(out, "Health:   {} ({})", status.health, status.health_reason);
    }
    if !status.last_error.is_empty() {
        let _ = writeln!(out, "Error:    {}", status.last_error);
    }

    if status.devices.is_empty() {
        let _ = writeln!(out, "\nNo devices known.");
        return out;
    }

    let width = status
        .devices
        .iter()
        .map(|d| d.display_name().chars().count())
        .max()
        .unwrap_or(0);
    let _ = writeln!(out);
    for device in &status.devices {
        let _ = writeln!(out, "{}", format_device_line(device, width));
    }
    out
}

/// `Name   bluetooth   1 ms   synced (1 ms)   bt:aa:bb:...`
pub fn format_device_line(device: &DeviceInfo, name_width: usize) -> String {
    let marker = match (device.present, device.enabled, device.synced) {
        (false, _, _) => '-',
        (true, false, _) => ' ',
        (true, true, true) => '*',
        (true, true, false) => '!',
    };
    let status = if device.present {
        device.status.as_str()
    } else {
        "absent"
    };
    format!(
        "{} {:<name_width$}  {:<9}  {:>4} ms  {:<28}  {}",
        marker,
        device.display_name(),
        device.class,
        device.delay_ms,
        status,
        device.key,
        name_width = name_width,
    )
}

/// Short result of an action: how many devices are in sync, then one line
/// per device that is not.
pub fn format_outcome(status: &EngineStatus) -> String {
    let expected = status
        .devices
        .iter()
        .filter(|d| d.present && d.enabled)
        .count();
    let mut out = format!("{} of {} devices in sync", status.synced_count(), expected);
    for device in status.unsynced() {
        let _ = write!(out, "\n  {}", device.summary());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(key: &str, name: &str, synced: bool, status: &str) -> DeviceInfo {
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
            status: status.to_string(),
        }
    }

    fn status(devices: Vec<DeviceInfo>) -> EngineStatus {
        EngineStatus {
            health: "healthy".to_string(),
            server_available: true,
            server_name: "PulseAudio (on PipeWire 1.0.5)".to_string(),
            master_present: true,
            master_is_default: true,
            routing_source: "audio_master.monitor".to_string(),
            sync_active: true,
            devices,
            ..Default::default()
        }
    }

    #[test]
    fn test_outcome_lists_unsynced_devices() {
        let s = status(vec![
            device("bt:aa", "Speaker A", true, "synced (1 ms)"),
            device("alsa:x", "Analog Card 2", false, "not synced (loopback rejected)"),
        ]);
        assert_eq!(
            format_outcome(&s),
            "1 of 2 devices in sync\n  Analog Card 2: not synced (loopback rejected)"
        );
    }

    #[test]
    fn test_outcome_ignores_absent_and_disabled() {
        let mut absent = device("bt:bb", "Speaker B", false, "absent");
        absent.present = false;
        let mut disabled = device("sink:tunnel", "Tunnel", false, "disabled");
        disabled.enabled = false;
        let s = status(vec![device("bt:aa", "A", true, "synced (1 ms)"), absent, disabled]);
        assert_eq!(format_outcome(&s), "1 of 1 devices in sync");
    }

    #[test]
    fn test_status_header() {
        let text = format_status(&status(vec![]));
        assert!(text.contains("Server:   PulseAudio (on PipeWire 1.0.5)"));
        assert!(text.contains("Routing:  audio_master.monitor"));
        assert!(text.contains("No devices known."));
    }

    #[test]
    fn test_status_when_paused_or_down() {
        let mut s = status(vec![]);
        s.sync_active = false;
        assert!(format_status(&s).contains("paused"));

        s.server_available = false;
        s.health = "suspect".to_string();
        s.health_reason = "audio server not running".to_string();
        let text = format_status(&s);
        assert!(text.contains("Server:   not running"));
        assert!(text.contains("Health:   suspect (audio server not running)"));
    }

    #[test]
    fn test_device_line_markers() {
        let synced = device("bt:aa", "Speaker", true, "synced (1 ms)");
        assert!(format_device_line(&synced, 7).starts_with("* Speaker "));
        let failed = device("bt:aa", "Speaker", false, "not synced (loopback missing)");
        assert!(format_device_line(&failed, 7).starts_with("! Speaker"));
        let mut gone = failed.clone();
        gone.present = false;
        assert!(format_device_line(&gone, 7).contains("absent"));
    }
}
