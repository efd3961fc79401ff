// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Reconciliation: converge the server's routing graph to the desired one.
//!
//! A pass queries the server fresh, classifies devices, diffs desired against
//! actual, applies the ordered plan and re-queries to verify. Reported status
//! always comes from the verification query, never from the apply results.

use crate::audio::server::{AudioServer, ServerError, ServerResult};
use crate::audio::types::{monitor_of, ModuleRecord, ServerInfo, SinkRecord};
use crate::config::SyncConfig;
use crate::sync::classify::{discover, ClassifyContext, DeviceClass, DeviceKey, DiscoveredDevice};
use crate::sync::recovery::{HealthState, HealthTracker};
use crate::sync::registry::Registry;
use crate::sync::topology::{diff, Edge, PlannedOp, Scope, Topology};
use audiosync_ipc::{DeviceInfo, EngineStatus};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, error, info, warn};

const MASTER_DESCRIPTION: &str = "Audio_Master";

/// Verified per-device result of a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOutcome {
    Synced { delay_ms: u32 },
    NotSynced { reason: String },
    Absent,
    Disabled,
}

impl DeviceOutcome {
    pub fn is_synced(&self) -> bool {
        matches!(self, DeviceOutcome::Synced { .. })
    }
}

impl fmt::Display for DeviceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceOutcome::Synced { delay_ms } => write!(f, "synced ({} ms)", delay_ms),
            DeviceOutcome::NotSynced { reason } => write!(f, "not synced ({})", reason),
            DeviceOutcome::Absent => f.write_str("absent"),
            DeviceOutcome::Disabled => f.write_str("disabled"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub server_available: bool,
    pub server_name: String,
    pub master_present: bool,
    pub master_is_default: bool,
    pub routing_source: String,
    pub outcomes: BTreeMap<DeviceKey, DeviceOutcome>,
    /// Mutating calls the server accepted.
    pub ops_applied: usize,
    pub errors: Vec<String>,
    pub cancelled: bool,
    /// Verified actual matches desired within the pass scope.
    pub converged: bool,
}

impl SyncReport {
    pub fn outcome(&self, key: &DeviceKey) -> Option<&DeviceOutcome> {
        self.outcomes.get(key)
    }
}

/// One fresh read of the server.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    pub info: ServerInfo,
    pub sinks: Vec<SinkRecord>,
    pub modules: Vec<ModuleRecord>,
}

impl Snapshot {
    fn has_sink(&self, name: &str) -> bool {
        self.sinks.iter().any(|s| s.name == name)
    }
}

/// Single owner of the reconcile-apply-verify cycle.
pub struct Reconciler {
    pub(crate) server: Box<dyn AudioServer>,
    pub(crate) config: SyncConfig,
    pub(crate) registry: Registry,
    pub(crate) health: HealthTracker,
    /// False after cleanup: passes observe but do not mutate.
    pub(crate) sync_active: bool,
    /// Bluetooth devices already unmuted this connection.
    prepared: BTreeSet<DeviceKey>,
    last_report: SyncReport,
}

impl Reconciler {
    pub fn new(server: Box<dyn AudioServer>, config: SyncConfig) -> Self {
        let registry = Registry::from_config(&config.devices);
        Self {
            server,
            config,
            registry,
            health: HealthTracker::default(),
            sync_active: true,
            prepared: BTreeSet::new(),
            last_report: SyncReport::default(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn health(&self) -> &HealthState {
        self.health.state()
    }

    pub fn last_report(&self) -> &SyncReport {
        &self.last_report
    }

    pub fn is_sync_active(&self) -> bool {
        self.sync_active
    }

    pub fn set_sync_active(&mut self, active: bool) {
        self.sync_active = active;
    }

    /// Forget which Bluetooth sinks were already unmuted.
    pub(crate) fn clear_prepared(&mut self) {
        self.prepared.clear();
    }

    /// Current configuration with the registry's device table folded in.
    pub fn config_snapshot(&self) -> SyncConfig {
        let mut config = self.config.clone();
        config.devices = self.registry.to_config();
        config
    }

    pub(crate) fn classify_context(&self) -> ClassifyContext<'_> {
        ClassifyContext {
            master_sink: &self.config.master_sink,
            eq_sink: &self.config.eq_sink,
        }
    }

    pub(crate) fn query(&self) -> ServerResult<Snapshot> {
        let info = self.server.server_info()?;
        let sinks = self.server.list_sinks()?;
        let modules = self.server.list_modules()?;
        debug!(
            "Queried {} sinks, {} modules (default sink {:?})",
            sinks.len(),
            modules.len(),
            info.default_sink
        );
        Ok(Snapshot {
            info,
            sinks,
            modules,
        })
    }

    /// Enumerate devices without touching the registry or routing.
    pub fn enumerate(&self) -> ServerResult<Vec<DiscoveredDevice>> {
        let sinks = self.server.list_sinks()?;
        Ok(discover(&sinks, &self.classify_context()))
    }

    /// Sink that receives application audio: the EQ sink when enabled and
    /// present, otherwise the master sink.
    pub(crate) fn routing_head(&self, snapshot: &Snapshot) -> String {
        if self.config.eq_enabled && snapshot.has_sink(&self.config.eq_sink) {
            self.config.eq_sink.clone()
        } else {
            self.config.master_sink.clone()
        }
    }

    /// Whether a loopback module was loaded by the engine.
    pub(crate) fn is_engine_loopback(&self, module: &ModuleRecord) -> bool {
        let engine_sources = [
            monitor_of(&self.config.master_sink),
            monitor_of(&self.config.eq_sink),
        ];
        match (module.loopback_source(), module.loopback_target()) {
            (Some(source), Some(target)) => {
                engine_sources.iter().any(|s| s == source)
                    && target != self.config.master_sink
                    && target != self.config.eq_sink
            }
            _ => false,
        }
    }

    fn actual_topology(&self, snapshot: &Snapshot) -> Topology {
        let head = self.routing_head(snapshot);
        let edges = snapshot
            .modules
            .iter()
            .filter(|m| self.is_engine_loopback(m))
            .filter_map(|m| {
                let target = m.loopback_target()?;
                let key = self
                    .registry
                    .key_for_sink(target)
                    .cloned()
                    .unwrap_or_else(|| DeviceKey::from_sink_name(target));
                Some(Edge {
                    key,
                    source: m.loopback_source()?.to_string(),
                    sink: target.to_string(),
                    delay_ms: m.loopback_latency_ms(),
                    module_id: Some(m.id),
                })
            })
            .collect();

        Topology {
            master_present: snapshot.has_sink(&self.config.master_sink),
            head_is_default: snapshot.info.default_sink.as_deref() == Some(head.as_str()),
            edges,
            retained: BTreeSet::new(),
        }
    }

    fn desired_topology(&self, snapshot: &Snapshot, now: Instant) -> Topology {
        let source = monitor_of(&self.routing_head(snapshot));
        let grace = self.config.monitor.absent_grace();
        let mut desired = Topology {
            master_present: true,
            head_is_default: true,
            ..Default::default()
        };

        for entry in self.registry.entries().filter(|e| e.enabled) {
            match (&entry.sink_name, entry.present) {
                (Some(sink), true) => desired.edges.push(Edge::desired(
                    entry.key.clone(),
                    &source,
                    sink,
                    entry.delay_ms(&self.config.delays),
                )),
                _ if entry.within_grace(grace, now) => {
                    desired.retained.insert(entry.key.clone());
                }
                _ => {}
            }
        }
        desired
    }

    /// Run one pass. Never fails: an unreachable or stuck server is reported
    /// in the returned report and retried by the caller.
    pub fn run(&mut self, scope: &Scope, cancel: &AtomicBool) -> SyncReport {
        let report = match self.pass(scope, cancel) {
            Ok(report) => report,
            Err(e) if e.is_fatal() => {
                error!("Reconciliation aborted: {}", e);
                self.aborted_report(&e)
            }
            Err(e) => {
                warn!("Reconciliation stalled: {}", e);
                self.health.mark_suspect(e.to_string());
                self.aborted_report(&e)
            }
        };
        self.last_report = report.clone();
        report
    }

    /// Report for a pass that could not query the server. A stuck server is
    /// still running, so the last verified routing facts are carried over.
    fn aborted_report(&self, err: &ServerError) -> SyncReport {
        let reason = match err {
            ServerError::ServerUnavailable(_) => "audio server not running",
            ServerError::Timeout(..) => "audio server timed out",
            ServerError::OperationRejected(_) => "audio server query failed",
        };
        let outcomes = self
            .registry
            .entries()
            .map(|e| {
                let outcome = if e.enabled {
                    DeviceOutcome::NotSynced {
                        reason: reason.to_string(),
                    }
                } else {
                    DeviceOutcome::Disabled
                };
                (e.key.clone(), outcome)
            })
            .collect();

        let mut report = SyncReport {
            server_available: !err.is_fatal(),
            outcomes,
            errors: vec![err.to_string()],
            ..Default::default()
        };
        if report.server_available {
            let last = &self.last_report;
            report.server_name = last.server_name.clone();
            report.master_present = last.master_present;
            report.master_is_default = last.master_is_default;
            report.routing_source = last.routing_source.clone();
        }
        report
    }

    fn pass(&mut self, scope: &Scope, cancel: &AtomicBool) -> ServerResult<SyncReport> {
        let now = Instant::now();

        // Fresh query; nothing about the graph is cached between passes.
        let snapshot = self.query()?;

        // Classify and update presence.
        let discovered = discover(&snapshot.sinks, &self.classify_context());
        let delta = self.registry.observe(&discovered, now);
        if !delta.is_empty() {
            debug!("Presence changed for {:?}", delta.keys());
        }
        for key in &delta.disappeared {
            self.prepared.remove(key);
        }

        let mut report = SyncReport {
            server_available: true,
            server_name: snapshot.info.server_name.clone(),
            ..Default::default()
        };

        if !self.sync_active {
            debug!("Sync paused, observing only");
            self.verify(&snapshot, scope, &BTreeMap::new(), now, &mut report);
            report.converged = true;
            return Ok(report);
        }

        // Desired vs actual.
        let actual = self.actual_topology(&snapshot);
        let desired = self.desired_topology(&snapshot, now);
        let plan = diff(&desired, &actual).plan(scope);
        if plan.is_empty() {
            debug!("Topology already converged ({} edges)", actual.edges.len());
        } else {
            info!("Applying {} routing operations", plan.len());
        }

        // Apply, removals before creations per key.
        let head = self.routing_head(&snapshot);
        let mut failures: BTreeMap<DeviceKey, ServerError> = BTreeMap::new();
        let mut blocked: BTreeSet<DeviceKey> = BTreeSet::new();
        let mut head_changed = false;

        for op in &plan {
            if cancel.load(Ordering::Relaxed) {
                warn!("Reconciliation cancelled with operations pending");
                report.cancelled = true;
                break;
            }
            // Never load a second loopback beside one that failed to unload.
            if let PlannedOp::CreateEdge { key, .. } = op {
                if blocked.contains(key) {
                    debug!("Skipping loopback for {}: stale loopback still loaded", key);
                    continue;
                }
            }
            match self.apply(op, &head) {
                Ok(()) => {
                    report.ops_applied += 1;
                    if matches!(op, PlannedOp::CreateMaster | PlannedOp::RestoreDefault) {
                        head_changed = true;
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("{:?} failed: {}", op, e);
                    report.errors.push(e.to_string());
                    if let PlannedOp::RemoveEdge { key, .. } = op {
                        blocked.insert(key.clone());
                    }
                    if let Some(key) = op.key() {
                        failures.entry(key.clone()).or_insert(e);
                    } else {
                        self.health.mark_suspect(e.to_string());
                    }
                }
            }
        }

        if head_changed && self.config.move_streams && !report.cancelled {
            self.move_streams_to(&head);
        }

        // Re-query and verify.
        let verified = self.query()?;
        let discovered = discover(&verified.sinks, &self.classify_context());
        self.registry.observe(&discovered, now);

        for (key, err) in &failures {
            let vanished = !self.registry.get(key).map(|e| e.present).unwrap_or(false);
            if vanished {
                info!("{} vanished during apply", key);
            } else {
                self.health.mark_suspect(format!("{}: {}", key, err));
            }
        }

        self.verify(&verified, scope, &failures, now, &mut report);
        if !report.cancelled {
            self.health.record_pass(report.converged, scope.is_all() && failures.is_empty());
        }

        Ok(report)
    }

    fn apply(&mut self, op: &PlannedOp, head: &str) -> ServerResult<()> {
        match op {
            PlannedOp::CreateMaster => self
                .server
                .create_null_sink(&self.config.master_sink, MASTER_DESCRIPTION)
                .map(|_| ()),
            PlannedOp::RestoreDefault => self.server.set_default_sink(head),
            PlannedOp::RemoveEdge { key, module_id } => {
                info!("Removing loopback {} for {}", module_id, key);
                self.server.remove_module(*module_id)
            }
            PlannedOp::CreateEdge {
                key,
                source,
                sink,
                delay_ms,
            } => {
                self.prepare_bluetooth(key, sink)?;
                self.server
                    .create_loopback(source, sink, *delay_ms)
                    .map(|_| ())
            }
        }
    }

    /// Unmute and raise a Bluetooth sink the first time it is attached.
    fn prepare_bluetooth(&mut self, key: &DeviceKey, sink: &str) -> ServerResult<()> {
        let is_bluetooth = self
            .registry
            .get(key)
            .and_then(|e| e.class)
            .map(|c| c == DeviceClass::Bluetooth)
            .unwrap_or(false);
        if !self.config.prepare_bluetooth || !is_bluetooth || self.prepared.contains(key) {
            return Ok(());
        }

        let prepared = self
            .server
            .set_sink_mute(sink, false)
            .and_then(|_| self.server.set_sink_volume(sink, 100));
        match prepared {
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!("Failed to prepare {}: {}", sink, e),
            Ok(()) => {}
        }
        self.prepared.insert(key.clone());
        Ok(())
    }

    /// Move application streams onto the routing head, leaving loopback and
    /// filter plumbing alone.
    pub(crate) fn move_streams_to(&self, head: &str) {
        let inputs = match self.server.list_sink_inputs() {
            Ok(inputs) => inputs,
            Err(e) => {
                warn!("Cannot list streams: {}", e);
                return;
            }
        };
        let modules = self.server.list_modules().unwrap_or_default();
        let loopbacks: BTreeSet<u32> = modules
            .iter()
            .filter(|m| m.is_loopback())
            .map(|m| m.id)
            .collect();
        let head_id = self
            .server
            .list_sinks()
            .ok()
            .and_then(|sinks| sinks.into_iter().find(|s| s.name == head).map(|s| s.id));

        let mut moved = 0;
        for input in inputs.iter().filter(|i| !i.is_internal(&loopbacks)) {
            if head_id.is_some() && input.sink == head_id {
                continue;
            }
            match self.server.move_sink_input(input.id, head) {
                Ok(()) => moved += 1,
                Err(e) => debug!("Could not move stream {}: {}", input.id, e),
            }
        }
        if moved > 0 {
            info!("Moved {} streams to '{}'", moved, head);
        }
    }

    /// Fill `report` from a verification snapshot.
    fn verify(
        &self,
        snapshot: &Snapshot,
        scope: &Scope,
        failures: &BTreeMap<DeviceKey, ServerError>,
        now: Instant,
        report: &mut SyncReport,
    ) {
        let head = self.routing_head(snapshot);
        let actual = self.actual_topology(snapshot);
        let desired = self.desired_topology(snapshot, now);

        report.master_present = actual.master_present;
        report.master_is_default = actual.head_is_default;
        report.routing_source = monitor_of(&head);

        let remaining = diff(&desired, &actual);
        report.converged = !remaining.touches(scope);
        if !report.converged {
            debug!("Verification diverges: {:?}", remaining);
        }

        for entry in self.registry.entries() {
            let outcome = if !entry.enabled {
                DeviceOutcome::Disabled
            } else if !entry.present {
                DeviceOutcome::Absent
            } else if !self.sync_active {
                DeviceOutcome::NotSynced {
                    reason: "sync paused".to_string(),
                }
            } else {
                let want = desired.edges_for(&entry.key).next();
                let have: Vec<&Edge> = actual.edges_for(&entry.key).collect();
                match (want, have.as_slice()) {
                    (Some(want), [one])
                        if one.delay_ms == want.delay_ms
                            && one.source == want.source
                            && one.sink == want.sink =>
                    {
                        DeviceOutcome::Synced {
                            delay_ms: one.delay_ms,
                        }
                    }
                    _ => DeviceOutcome::NotSynced {
                        reason: self.not_synced_reason(
                            &entry.key,
                            &have,
                            failures,
                            scope,
                            report.cancelled,
                        ),
                    },
                }
            };
            report.outcomes.insert(entry.key.clone(), outcome);
        }
    }

    fn not_synced_reason(
        &self,
        key: &DeviceKey,
        have: &[&Edge],
        failures: &BTreeMap<DeviceKey, ServerError>,
        scope: &Scope,
        cancelled: bool,
    ) -> String {
        if let Some(err) = failures.get(key) {
            return match err {
                ServerError::Timeout(..) => "loopback timed out".to_string(),
                _ if have.is_empty() => "loopback rejected".to_string(),
                _ => "stale loopback could not be removed".to_string(),
            };
        }
        if cancelled {
            return "cancelled".to_string();
        }
        if !scope.includes(key) {
            return "pending".to_string();
        }
        match have.len() {
            0 => "loopback missing".to_string(),
            1 => format!("loopback at {} ms", have[0].delay_ms),
            n => format!("{} duplicate loopbacks", n),
        }
    }

    /// Status snapshot for clients.
    pub fn status(&self) -> EngineStatus {
        let report = &self.last_report;
        let devices = self
            .registry
            .entries()
            .map(|entry| {
                let outcome = report
                    .outcomes
                    .get(&entry.key)
                    .cloned()
                    .unwrap_or_else(|| DeviceOutcome::NotSynced {
                        reason: "not yet checked".to_string(),
                    });
                DeviceInfo {
                    key: entry.key.to_string(),
                    name: entry.name.clone(),
                    sink_name: entry.sink_name.clone().unwrap_or_default(),
                    class: entry
                        .class
                        .map(|c| c.as_str().to_string())
                        .unwrap_or_else(|| "unknown".to_string()),
                    present: entry.present,
                    enabled: entry.enabled,
                    synced: outcome.is_synced(),
                    delay_ms: entry.delay_ms(&self.config.delays),
                    reported_latency_ms: entry
                        .reported_latency_ms
                        .map(|l| l as i32)
                        .unwrap_or(-1),
                    status: outcome.to_string(),
                }
            })
            .collect();

        let (health, health_reason) = match self.health.state() {
            HealthState::Healthy => ("healthy", String::new()),
            HealthState::Suspect { reason } => ("suspect", reason.clone()),
            HealthState::Resetting => ("resetting", String::new()),
        };

        EngineStatus {
            health: health.to_string(),
            health_reason,
            server_available: report.server_available,
            server_name: report.server_name.clone(),
            master_present: report.master_present,
            master_is_default: report.master_is_default,
            routing_source: report.routing_source.clone(),
            sync_active: self.sync_active,
            last_error: report.errors.last().cloned().unwrap_or_default(),
            devices,
        }
    }
}
