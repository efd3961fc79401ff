// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Engine health tracking plus the user-triggered reset and cleanup actions.

use crate::audio::server::{ServerError, ServerResult};
use crate::sync::classify::{discover, DeviceClass};
use crate::sync::reconcile::{Reconciler, SyncReport};
use crate::sync::topology::Scope;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

/// Consecutive divergent verifications before the engine is suspect.
const DIVERGENCE_LIMIT: u32 = 2;

/// Pause after clearing session manager state so it can re-announce sinks.
const RESET_SETTLE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HealthState {
    #[default]
    Healthy,
    Suspect {
        reason: String,
    },
    Resetting,
}

#[derive(Debug, Default)]
pub struct HealthTracker {
    state: HealthState,
    divergent_passes: u32,
}

impl HealthTracker {
    pub fn state(&self) -> &HealthState {
        &self.state
    }

    pub fn mark_suspect(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if !matches!(self.state, HealthState::Suspect { .. }) {
            warn!("Engine suspect: {}", reason);
        }
        self.state = HealthState::Suspect { reason };
    }

    /// Record a verified pass. A clean, converged full pass clears suspicion.
    pub fn record_pass(&mut self, converged: bool, clean_full_pass: bool) {
        if converged {
            self.divergent_passes = 0;
            if clean_full_pass && matches!(self.state, HealthState::Suspect { .. }) {
                info!("Engine healthy again");
                self.state = HealthState::Healthy;
            }
            return;
        }

        self.divergent_passes += 1;
        if self.divergent_passes >= DIVERGENCE_LIMIT {
            let reason = format!(
                "routing diverged from desired after {} passes",
                self.divergent_passes
            );
            self.mark_suspect(reason);
        }
    }

    pub fn begin_reset(&mut self) {
        self.state = HealthState::Resetting;
        self.divergent_passes = 0;
    }

    pub fn finish_reset(&mut self, converged: bool) {
        if self.state == HealthState::Resetting {
            self.state = if converged {
                HealthState::Healthy
            } else {
                HealthState::Suspect {
                    reason: "reset did not converge".to_string(),
                }
            };
        }
    }
}

impl Reconciler {
    /// Whether a sink name is the master or a duplicate the server renamed
    /// (`audio_master.2`).
    fn is_master_like(&self, sink_name: &str) -> bool {
        let master = &self.config.master_sink;
        sink_name == master
            || sink_name
                .strip_prefix(master.as_str())
                .is_some_and(|rest| rest.starts_with('.') && !rest.ends_with(".monitor"))
    }

    /// Unload every engine loopback and every module providing a master-like
    /// sink. Returns the number of modules that could not be removed.
    fn teardown(&mut self) -> ServerResult<usize> {
        let sinks = self.server.list_sinks()?;
        let modules = self.server.list_modules()?;

        let mut targets: Vec<u32> = modules
            .iter()
            .filter(|m| self.is_engine_loopback(m))
            .map(|m| m.id)
            .collect();
        targets.extend(
            modules
                .iter()
                .filter(|m| m.provided_sink().is_some_and(|s| self.is_master_like(s)))
                .map(|m| m.id),
        );
        targets.extend(
            sinks
                .iter()
                .filter(|s| self.is_master_like(&s.name))
                .filter_map(|s| s.owner_module),
        );
        targets.sort_unstable();
        targets.dedup();

        info!("Tearing down {} engine modules", targets.len());
        let mut failed = 0;
        for id in targets {
            match self.server.remove_module(id) {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Failed to unload module {}: {}", id, e);
                    self.health.mark_suspect(e.to_string());
                    failed += 1;
                }
            }
        }
        Ok(failed)
    }

    /// Last-resort rebuild: tear everything down, clear the session manager's
    /// stale state when the server family needs it, then run a full pass
    /// from empty.
    pub fn reset(&mut self, cancel: &AtomicBool) -> SyncReport {
        info!("Resetting audio routing");
        self.health.begin_reset();
        self.sync_active = true;
        self.clear_prepared();

        if let Err(e) = self.teardown_and_clear() {
            error!("Reset aborted: {}", e);
            self.health.finish_reset(false);
            return self.run(&Scope::All, cancel);
        }

        let report = self.run(&Scope::All, cancel);
        self.health
            .finish_reset(report.server_available && report.converged && !report.cancelled);
        report
    }

    fn teardown_and_clear(&mut self) -> ServerResult<()> {
        self.teardown()?;

        let caps = self.server.capabilities();
        if caps.stale_module_cache {
            info!(
                "Clearing cached device state: {}",
                caps.state_reset_command.join(" ")
            );
            match self.server.reset_server_state() {
                Ok(()) => thread::sleep(RESET_SETTLE),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("Device manager reset failed: {}", e),
            }
        }
        Ok(())
    }

    /// Remove the routing graph, hand the default sink back to a physical
    /// device and pause automatic syncing until the next sync-all.
    pub fn cleanup(&mut self, cancel: &AtomicBool) -> SyncReport {
        info!("Cleaning up audio routing");
        self.sync_active = false;
        self.clear_prepared();

        if let Err(e) = self.teardown().and_then(|_| self.restore_physical_default()) {
            error!("Cleanup incomplete: {}", e);
        }
        self.run(&Scope::All, cancel)
    }

    fn restore_physical_default(&mut self) -> ServerResult<()> {
        let sinks = self.server.list_sinks()?;
        let devices = discover(&sinks, &self.classify_context());
        let rank = |class: DeviceClass| match class {
            DeviceClass::Analog => 0,
            DeviceClass::Usb => 1,
            DeviceClass::Bluetooth => 2,
            DeviceClass::Other => 3,
        };
        let Some(target) = devices.iter().min_by_key(|d| rank(d.class)) else {
            warn!("No physical device to fall back to");
            return Ok(());
        };

        match self.server.set_default_sink(&target.sink_name) {
            Ok(()) => {
                info!("Default sink restored to '{}'", target.sink_name);
                Ok(())
            }
            Err(e @ ServerError::ServerUnavailable(_)) => Err(e),
            Err(e) => {
                warn!("Failed to restore default sink: {}", e);
                Ok(())
            }
        }
    }
}
