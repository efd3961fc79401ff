// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Hot-plug detection by comparing successive device enumerations.

use crate::audio::server::ServerResult;
use crate::sync::classify::{DeviceKey, DiscoveredDevice};
use crate::sync::topology::Scope;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// What the worker should do after a monitor tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorDecision {
    Idle,
    Reconcile(Scope),
}

#[derive(Debug)]
pub struct HotplugMonitor {
    /// Device key to sink name, from the previous enumeration.
    previous: Option<BTreeMap<DeviceKey, String>>,
    /// Disappeared devices whose loopback is kept until the grace expires.
    departing: BTreeMap<DeviceKey, Instant>,
    absent_grace: Duration,
    server_down: bool,
    full_pass_requested: bool,
}

impl HotplugMonitor {
    pub fn new(absent_grace: Duration) -> Self {
        Self {
            previous: None,
            departing: BTreeMap::new(),
            absent_grace,
            server_down: false,
            full_pass_requested: false,
        }
    }

    pub fn server_down(&self) -> bool {
        self.server_down
    }

    /// Ask for a full pass on the next tick (default sink or module changed
    /// behind our back).
    pub fn request_full_pass(&mut self) {
        self.full_pass_requested = true;
    }

    /// Adopt the enumeration a completed pass already acted on, so the next
    /// tick does not report the same change again.
    /// Devices that left since the last baseline still get their grace expiry.
    pub fn sync_baseline(&mut self, present: BTreeMap<DeviceKey, String>, now: Instant) {
        if let Some(previous) = &self.previous {
            for key in previous.keys().filter(|k| !present.contains_key(*k)) {
                self.departing.entry(key.clone()).or_insert(now);
            }
        }
        self.departing.retain(|key, _| !present.contains_key(key));
        self.previous = Some(present);
    }

    pub fn evaluate(
        &mut self,
        enumeration: ServerResult<Vec<DiscoveredDevice>>,
        now: Instant,
    ) -> MonitorDecision {
        let devices = match enumeration {
            Ok(devices) => devices,
            Err(e) => {
                if !self.server_down {
                    info!("Audio server unreachable, waiting: {}", e);
                }
                self.server_down = true;
                return MonitorDecision::Idle;
            }
        };

        let current = snapshot(&devices);
        let previous = self.previous.replace(current.clone());

        if self.server_down || previous.is_none() || self.full_pass_requested {
            if self.server_down {
                info!("Audio server reachable again, running full sync");
            }
            self.server_down = false;
            self.full_pass_requested = false;
            self.departing.clear();
            return MonitorDecision::Reconcile(Scope::All);
        }
        let previous = previous.unwrap_or_default();

        let mut changed: BTreeSet<DeviceKey> = BTreeSet::new();
        for (key, sink) in &current {
            if previous.get(key) != Some(sink) {
                changed.insert(key.clone());
                self.departing.remove(key);
            }
        }
        for key in previous.keys().filter(|k| !current.contains_key(*k)) {
            changed.insert(key.clone());
            self.departing.insert(key.clone(), now);
        }

        // Absent devices whose grace just ran out need their edge removed.
        let expired: Vec<DeviceKey> = self
            .departing
            .iter()
            .filter(|(_, since)| now.saturating_duration_since(**since) >= self.absent_grace)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.departing.remove(&key);
            changed.insert(key);
        }

        if changed.is_empty() {
            return MonitorDecision::Idle;
        }
        debug!("Device set changed: {:?}", changed);
        MonitorDecision::Reconcile(Scope::Keys(changed))
    }
}

fn snapshot(devices: &[DiscoveredDevice]) -> BTreeMap<DeviceKey, String> {
    devices
        .iter()
        .map(|d| (d.key.clone(), d.sink_name.clone()))
        .collect()
}
