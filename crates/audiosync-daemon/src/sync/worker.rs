// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Dedicated thread that owns the reconciler.
//!
//! Every pass, user command and hot-plug tick runs on this one thread, so
//! two passes can never mutate the server at the same time. Callers talk to
//! it through [`SyncWorker`], which queues commands and reads the last
//! published status without waiting for the thread.

use crate::audio::subscribe::{Facility, ServerEvent};
use crate::config::ConfigManager;
use crate::service::SignalEvent;
use crate::sync::classify::DeviceKey;
use crate::sync::monitor::{HotplugMonitor, MonitorDecision};
use crate::sync::reconcile::{Reconciler, SyncReport};
use crate::sync::topology::Scope;
use audiosync_ipc::{DaemonError, EngineStatus};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc as tokio_mpsc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Events arrive in bursts when a device connects; wait this long before
/// acting on the first one.
const EVENT_DEBOUNCE: Duration = Duration::from_millis(200);

pub type Reply<T> = oneshot::Sender<Result<T, DaemonError>>;

/// Commands sent to the sync thread.
#[derive(Debug)]
pub enum SyncCommand {
    /// Resume syncing and run a full pass.
    SyncAll { reply: Reply<EngineStatus> },
    SetDelay {
        key: DeviceKey,
        delay_ms: u32,
        reply: Reply<u32>,
    },
    SetEnabled {
        key: DeviceKey,
        enabled: bool,
        reply: Reply<()>,
    },
    Cleanup { reply: Reply<EngineStatus> },
    Reset { reply: Reply<EngineStatus> },
    ForgetAbsent { reply: Reply<Vec<String>> },
    /// Notification from `pactl subscribe`.
    ServerEvent(ServerEvent),
    Shutdown { cleanup: bool },
}

impl SyncCommand {
    /// Commands that abort whatever pass is currently running.
    fn preempts(&self) -> bool {
        matches!(
            self,
            SyncCommand::Cleanup { .. } | SyncCommand::Reset { .. } | SyncCommand::Shutdown { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to spawn sync thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("Sync thread has stopped")]
    Stopped,
}

/// Handle to the sync thread.
pub struct SyncWorker {
    cmd_tx: Sender<SyncCommand>,
    cancel: Arc<AtomicBool>,
    status: Arc<RwLock<EngineStatus>>,
    handle: Option<JoinHandle<()>>,
}

impl SyncWorker {
    /// Spawn the thread. It runs a full pass immediately, then follows
    /// commands and the monitor interval.
    pub fn spawn(
        reconciler: Reconciler,
        store: Option<ConfigManager>,
        signal_tx: Option<tokio_mpsc::UnboundedSender<SignalEvent>>,
    ) -> Result<Self, WorkerError> {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let cancel = Arc::new(AtomicBool::new(false));
        let status = Arc::new(RwLock::new(reconciler.status()));

        let config = reconciler.config_snapshot();
        let state = WorkerState {
            monitor: HotplugMonitor::new(config.monitor.absent_grace()),
            interval: config.monitor.interval(),
            purge_after: config.monitor.purge_after(),
            reconciler,
            store,
            cancel: cancel.clone(),
            status: status.clone(),
            signal_tx,
        };

        let handle = thread::Builder::new()
            .name("audiosync-sync".to_string())
            .spawn(move || state.run(cmd_rx))?;

        Ok(Self {
            cmd_tx,
            cancel,
            status,
            handle: Some(handle),
        })
    }

    /// Queue a command. Cleanup, reset and shutdown cancel the running pass.
    pub fn send(&self, cmd: SyncCommand) -> Result<(), WorkerError> {
        if cmd.preempts() {
            self.cancel.store(true, Ordering::SeqCst);
        }
        self.cmd_tx.send(cmd).map_err(|_| WorkerError::Stopped)
    }

    /// Callback for the event subscriber thread.
    pub fn event_sink(&self) -> impl Fn(ServerEvent) + Send + 'static {
        let tx = self.cmd_tx.clone();
        move |event| {
            let _ = tx.send(SyncCommand::ServerEvent(event));
        }
    }

    /// Last published status. Never waits for a running pass.
    pub fn status(&self) -> EngineStatus {
        self.status.read().clone()
    }

    /// Stop the thread, optionally tearing the routing down first.
    pub fn shutdown(mut self, cleanup: bool) {
        let _ = self.send(SyncCommand::Shutdown { cleanup });
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SyncWorker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.send(SyncCommand::Shutdown { cleanup: false });
            let _ = handle.join();
        }
    }
}

struct WorkerState {
    reconciler: Reconciler,
    monitor: HotplugMonitor,
    store: Option<ConfigManager>,
    cancel: Arc<AtomicBool>,
    status: Arc<RwLock<EngineStatus>>,
    signal_tx: Option<tokio_mpsc::UnboundedSender<SignalEvent>>,
    interval: Duration,
    purge_after: Option<Duration>,
}

impl WorkerState {
    fn run(mut self, cmd_rx: Receiver<SyncCommand>) {
        info!("Sync thread started");
        self.pass(&Scope::All);

        let mut next_tick = Instant::now() + self.interval;
        loop {
            let wait = next_tick.saturating_duration_since(Instant::now());
            match cmd_rx.recv_timeout(wait) {
                Ok(SyncCommand::Shutdown { cleanup }) => {
                    if cleanup {
                        self.cancel.store(false, Ordering::SeqCst);
                        let report = self.reconciler.cleanup(&self.cancel);
                        self.after_pass(&report, false);
                    }
                    break;
                }
                Ok(SyncCommand::ServerEvent(event)) => {
                    if !event.affects_topology() {
                        continue;
                    }
                    debug!("Server event: {:?}", event);
                    // Device-set deltas are caught by the monitor; module and
                    // server events can change routing without one.
                    if matches!(event.facility, Facility::Module | Facility::Server) {
                        self.monitor.request_full_pass();
                    }
                    next_tick = next_tick.min(Instant::now() + EVENT_DEBOUNCE);
                }
                Ok(cmd) => self.handle(cmd),
                Err(RecvTimeoutError::Timeout) => {
                    self.tick();
                    next_tick = Instant::now() + self.interval;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Command channel closed");
                    break;
                }
            }
        }
        info!("Sync thread stopped");
    }

    fn handle(&mut self, cmd: SyncCommand) {
        match cmd {
            SyncCommand::SyncAll { reply } => {
                info!("Sync all requested");
                self.reconciler.set_sync_active(true);
                let report = self.pass(&Scope::All);
                let _ = reply.send(self.reply_for(&report));
            }
            SyncCommand::SetDelay {
                key,
                delay_ms,
                reply,
            } => {
                let result = match self.reconciler.registry_mut().set_delay(&key, delay_ms) {
                    Some(applied) => {
                        info!("Delay for {} set to {} ms", key, applied);
                        self.pass(&single(key));
                        Ok(applied)
                    }
                    None => Err(DaemonError::DeviceNotFound(key.to_string())),
                };
                let _ = reply.send(result);
            }
            SyncCommand::SetEnabled {
                key,
                enabled,
                reply,
            } => {
                let result = if self.reconciler.registry_mut().set_enabled(&key, enabled) {
                    info!(
                        "Device {} {}",
                        key,
                        if enabled { "enabled" } else { "disabled" }
                    );
                    self.pass(&single(key));
                    Ok(())
                } else {
                    Err(DaemonError::DeviceNotFound(key.to_string()))
                };
                let _ = reply.send(result);
            }
            SyncCommand::Cleanup { reply } => {
                self.cancel.store(false, Ordering::SeqCst);
                let report = self.reconciler.cleanup(&self.cancel);
                self.after_pass(&report, true);
                let _ = reply.send(self.reply_for(&report));
            }
            SyncCommand::Reset { reply } => {
                self.cancel.store(false, Ordering::SeqCst);
                let report = self.reconciler.reset(&self.cancel);
                self.after_pass(&report, true);
                let _ = reply.send(self.reply_for(&report));
            }
            SyncCommand::ForgetAbsent { reply } => {
                let purged = self.reconciler.registry_mut().purge_absent(None);
                self.persist();
                self.publish();
                let _ = reply.send(Ok(purged.iter().map(|k| k.to_string()).collect()));
            }
            SyncCommand::ServerEvent(_) | SyncCommand::Shutdown { .. } => {}
        }
    }

    /// One monitor interval: enumerate, reconcile whatever changed, purge
    /// long-absent devices.
    fn tick(&mut self) {
        let enumeration = self.reconciler.enumerate();
        let lost_server = enumeration.is_err() && !self.monitor.server_down();

        match self.monitor.evaluate(enumeration, Instant::now()) {
            MonitorDecision::Reconcile(scope) => {
                self.pass(&scope);
            }
            MonitorDecision::Idle if lost_server => {
                // Publish the outage or the stall once.
                self.pass(&Scope::All);
            }
            MonitorDecision::Idle => {}
        }

        if let Some(age) = self.purge_after {
            if !self.reconciler.registry_mut().purge_absent(Some(age)).is_empty() {
                self.persist();
                self.publish();
            }
        }
    }

    fn pass(&mut self, scope: &Scope) -> SyncReport {
        let report = self.reconciler.run(scope, &self.cancel);
        self.after_pass(&report, scope.is_all());
        report
    }

    fn after_pass(&mut self, report: &SyncReport, full: bool) {
        if full && report.server_available && !report.cancelled {
            self.monitor
                .sync_baseline(self.reconciler.registry().present_sinks(), Instant::now());
        }
        if !report.errors.is_empty() {
            warn!("Pass finished with {} errors", report.errors.len());
        }
        self.persist();
        self.publish();
    }

    fn reply_for(&self, report: &SyncReport) -> Result<EngineStatus, DaemonError> {
        if report.cancelled {
            Err(DaemonError::Cancelled)
        } else if !report.server_available {
            Err(DaemonError::ServerUnavailable(
                report.errors.last().cloned().unwrap_or_default(),
            ))
        } else {
            Ok(self.status.read().clone())
        }
    }

    fn persist(&mut self) {
        if !self.reconciler.registry_mut().take_dirty() {
            return;
        }
        if let Some(ref store) = self.store {
            if let Err(e) = store.save(&self.reconciler.config_snapshot()) {
                error!("Failed to save config: {}", e);
            }
        }
    }

    /// Store the current status and signal clients when it changed.
    fn publish(&self) {
        let status = self.reconciler.status();
        {
            let mut current = self.status.write();
            if *current == status {
                return;
            }
            *current = status.clone();
        }
        if let Some(ref tx) = self.signal_tx {
            if let Err(e) = tx.send(SignalEvent::StatusChanged(status)) {
                warn!("Failed to send signal event: {}", e);
            }
        }
    }
}

fn single(key: DeviceKey) -> Scope {
    Scope::Keys(BTreeSet::from([key]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::fake::FakeServer;
    use crate::sync::reconcile::tests::{config, key, setup, ANALOG, BT_A, BT_X};

    fn spawn(fake_config: crate::config::SyncConfig) -> (FakeServer, SyncWorker) {
        let (fake, rec) = setup(fake_config);
        let worker = SyncWorker::spawn(rec, None, None).unwrap();
        (fake, worker)
    }

    fn sync_all(worker: &SyncWorker) -> Result<EngineStatus, DaemonError> {
        let (reply, rx) = oneshot::channel();
        worker.send(SyncCommand::SyncAll { reply }).unwrap();
        rx.blocking_recv().unwrap()
    }

    fn set_delay(worker: &SyncWorker, sink: &str, delay_ms: u32) -> Result<u32, DaemonError> {
        let (reply, rx) = oneshot::channel();
        worker
            .send(SyncCommand::SetDelay {
                key: key(sink),
                delay_ms,
                reply,
            })
            .unwrap();
        rx.blocking_recv().unwrap()
    }

    fn wait_for(worker: &SyncWorker, cond: impl Fn(&EngineStatus) -> bool) -> bool {
        for _ in 0..100 {
            if cond(&worker.status()) {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_sync_all_reports_verified_status() {
        let (fake, worker) = spawn(config());
        let status = sync_all(&worker).unwrap();
        assert!(status.master_present);
        assert!(status.master_is_default);
        assert_eq!(status.synced_count(), 2);
        assert!(fake.has_sink("audio_master"));
        worker.shutdown(false);
    }

    #[test]
    fn test_set_delay_rebuilds_only_that_edge() {
        let (fake, worker) = spawn(config());
        sync_all(&worker).unwrap();
        let bt_before = fake.loopbacks_to(BT_A)[0].id;

        assert_eq!(set_delay(&worker, ANALOG, 140), Ok(140));
        let analog = fake.loopbacks_to(ANALOG);
        assert_eq!(analog.len(), 1);
        assert_eq!(analog[0].loopback_latency_ms(), 140);
        assert_eq!(fake.loopbacks_to(BT_A)[0].id, bt_before);

        let status = worker.status();
        assert_eq!(status.device(key(ANALOG).as_str()).unwrap().delay_ms, 140);
        worker.shutdown(false);
    }

    #[test]
    fn test_set_delay_is_clamped() {
        let (_fake, worker) = spawn(config());
        assert_eq!(set_delay(&worker, ANALOG, 9000), Ok(500));
        worker.shutdown(false);
    }

    #[test]
    fn test_unknown_device_is_rejected() {
        let (_fake, worker) = spawn(config());
        assert!(matches!(
            set_delay(&worker, BT_X, 50),
            Err(DaemonError::DeviceNotFound(_))
        ));
        worker.shutdown(false);
    }

    #[test]
    fn test_disable_removes_edge() {
        let (fake, worker) = spawn(config());
        sync_all(&worker).unwrap();
        let (reply, rx) = oneshot::channel();
        worker
            .send(SyncCommand::SetEnabled {
                key: key(BT_A),
                enabled: false,
                reply,
            })
            .unwrap();
        assert_eq!(rx.blocking_recv().unwrap(), Ok(()));
        assert!(fake.loopbacks_to(BT_A).is_empty());
        assert_eq!(fake.loopbacks_to(ANALOG).len(), 1);
        worker.shutdown(false);
    }

    #[test]
    fn test_cleanup_then_sync_all_resumes() {
        let (fake, worker) = spawn(config());
        let (reply, rx) = oneshot::channel();
        worker.send(SyncCommand::Cleanup { reply }).unwrap();
        let status = rx.blocking_recv().unwrap().unwrap();
        assert!(!status.sync_active);
        assert!(!fake.has_sink("audio_master"));

        let status = sync_all(&worker).unwrap();
        assert!(status.sync_active);
        assert!(fake.has_sink("audio_master"));
        worker.shutdown(false);
    }

    #[test]
    fn test_unavailable_server_is_reported() {
        let (fake, worker) = spawn(config());
        fake.set_unavailable(true);
        assert!(matches!(
            sync_all(&worker),
            Err(DaemonError::ServerUnavailable(_))
        ));
        assert!(!worker.status().server_available);
        worker.shutdown(false);
    }

    #[test]
    fn test_stuck_server_reports_suspect() {
        let (fake, worker) = spawn(config());
        sync_all(&worker).unwrap();
        fake.stall_module_listing(true);

        let status = sync_all(&worker).unwrap();
        assert!(status.server_available);
        assert_eq!(status.health, "suspect");
        assert_eq!(status.synced_count(), 0);
        worker.shutdown(false);
    }

    #[test]
    fn test_hotplug_event_syncs_new_device() {
        let (fake, worker) = spawn(config());
        sync_all(&worker).unwrap();

        fake.add_sink(BT_X, "Speaker X");
        let sink = worker.event_sink();
        sink(ServerEvent::parse("Event 'new' on sink #120").unwrap());

        assert!(wait_for(&worker, |s| s
            .device(key(BT_X).as_str())
            .is_some_and(|d| d.synced)));
        assert_eq!(fake.loopbacks_to(BT_X).len(), 1);
        worker.shutdown(false);
    }

    #[test]
    fn test_forget_absent_devices() {
        let (fake, worker) = spawn(config());
        sync_all(&worker).unwrap();
        fake.unplug(BT_A);
        sync_all(&worker).unwrap();

        let (reply, rx) = oneshot::channel();
        worker.send(SyncCommand::ForgetAbsent { reply }).unwrap();
        assert_eq!(rx.blocking_recv().unwrap(), Ok(vec![key(BT_A).to_string()]));
        assert!(worker.status().device(key(BT_A).as_str()).is_none());
        worker.shutdown(false);
    }

    #[test]
    fn test_shutdown_with_cleanup_tears_down() {
        let (fake, worker) = spawn(config());
        sync_all(&worker).unwrap();
        worker.shutdown(true);
        assert!(!fake.has_sink("audio_master"));
        assert_eq!(fake.default_sink().as_deref(), Some(ANALOG));
    }

    #[test]
    fn test_status_changes_are_signalled() {
        let (_fake, rec) = setup(config());
        let (tx, mut rx) = tokio_mpsc::unbounded_channel();
        let worker = SyncWorker::spawn(rec, None, Some(tx)).unwrap();
        sync_all(&worker).unwrap();
        worker.shutdown(false);

        let mut last = None;
        while let Ok(SignalEvent::StatusChanged(status)) = rx.try_recv() {
            last = Some(status);
        }
        assert!(last.is_some_and(|s| s.master_present));
    }

    #[test]
    fn test_delay_change_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigManager::with_dir(dir.path()).unwrap();
        let (_fake, rec) = setup(config());
        let worker = SyncWorker::spawn(rec, Some(store), None).unwrap();
        set_delay(&worker, ANALOG, 150).unwrap();
        worker.shutdown(false);

        let saved = ConfigManager::with_dir(dir.path()).unwrap().load().unwrap();
        let entry = saved.devices.get(key(ANALOG).as_str()).unwrap();
        assert_eq!(entry.delay_ms, Some(150));
    }
}
