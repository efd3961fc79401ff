// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Daemon service: wires the audio server client, the sync thread and the
//! event subscriber together and exposes async request methods.

use crate::audio::subscribe::EventSubscriber;
use crate::audio::PactlClient;
use crate::config::{ConfigManager, SyncConfig};
use crate::sync::classify::DeviceKey;
use crate::sync::worker::Reply;
use crate::sync::{Reconciler, SyncCommand, SyncWorker, WorkerError};
use audiosync_ipc::{DaemonError, EngineStatus};
use thiserror::Error;
use tokio::sync::mpsc as tokio_mpsc;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// D-Bus signal events that need to be emitted.
#[derive(Debug, Clone)]
pub enum SignalEvent {
    StatusChanged(EngineStatus),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("Sync worker error: {0}")]
    Worker(#[from] WorkerError),
}

pub struct SyncService {
    worker: SyncWorker,
    subscriber: Option<EventSubscriber>,
    cleanup_on_exit: bool,
}

impl SyncService {
    /// Start against the live audio server through `pactl`.
    pub fn start(
        config_manager: ConfigManager,
        config: SyncConfig,
        signal_tx: tokio_mpsc::UnboundedSender<SignalEvent>,
    ) -> Result<Self, ServiceError> {
        let server = PactlClient::new(
            config.server.command_timeout(),
            config.server.family.family_override(),
            config.server.state_reset_command.clone(),
        );
        let cleanup_on_exit = config.cleanup_on_exit;
        let reconciler = Reconciler::new(Box::new(server), config);
        let mut service =
            Self::with_reconciler(reconciler, Some(config_manager), Some(signal_tx), cleanup_on_exit)?;

        match EventSubscriber::spawn(service.worker.event_sink()) {
            Ok(subscriber) => service.subscriber = Some(subscriber),
            Err(e) => warn!("Event subscription unavailable, polling only: {}", e),
        }
        Ok(service)
    }

    pub fn with_reconciler(
        reconciler: Reconciler,
        store: Option<ConfigManager>,
        signal_tx: Option<tokio_mpsc::UnboundedSender<SignalEvent>>,
        cleanup_on_exit: bool,
    ) -> Result<Self, ServiceError> {
        let worker = SyncWorker::spawn(reconciler, store, signal_tx)?;
        Ok(Self {
            worker,
            subscriber: None,
            cleanup_on_exit,
        })
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> SyncCommand,
    ) -> Result<T, DaemonError> {
        let (reply, rx) = oneshot::channel();
        self.worker
            .send(make(reply))
            .map_err(|e| DaemonError::Internal(e.to_string()))?;
        rx.await
            .map_err(|_| DaemonError::Internal("sync thread dropped the request".to_string()))?
    }

    pub async fn sync_all(&self) -> Result<EngineStatus, DaemonError> {
        self.request(|reply| SyncCommand::SyncAll { reply }).await
    }

    pub async fn set_device_delay(&self, key: &str, delay_ms: u32) -> Result<u32, DaemonError> {
        let key = DeviceKey::new(key);
        self.request(|reply| SyncCommand::SetDelay {
            key,
            delay_ms,
            reply,
        })
        .await
    }

    pub async fn set_device_enabled(&self, key: &str, enabled: bool) -> Result<(), DaemonError> {
        let key = DeviceKey::new(key);
        self.request(|reply| SyncCommand::SetEnabled {
            key,
            enabled,
            reply,
        })
        .await
    }

    pub async fn cleanup(&self) -> Result<EngineStatus, DaemonError> {
        self.request(|reply| SyncCommand::Cleanup { reply }).await
    }

    pub async fn reset(&self) -> Result<EngineStatus, DaemonError> {
        self.request(|reply| SyncCommand::Reset { reply }).await
    }

    pub async fn forget_absent_devices(&self) -> Result<Vec<String>, DaemonError> {
        self.request(|reply| SyncCommand::ForgetAbsent { reply }).await
    }

    pub fn status(&self) -> EngineStatus {
        self.worker.status()
    }

    /// Stop the subscriber and the sync thread. Tears the routing down
    /// first when `cleanup_on_exit` is set.
    pub fn shutdown(self) {
        info!("Shutting down sync service");
        if let Some(subscriber) = self.subscriber {
            subscriber.shutdown();
        }
        self.worker.shutdown(self.cleanup_on_exit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::reconcile::tests::{config, key, setup, ANALOG};

    fn service(cleanup_on_exit: bool) -> (crate::audio::fake::FakeServer, SyncService) {
        let (fake, rec) = setup(config());
        let svc = SyncService::with_reconciler(rec, None, None, cleanup_on_exit).unwrap();
        (fake, svc)
    }

    #[tokio::test]
    async fn test_requests_round_trip_through_worker() {
        let (fake, svc) = service(false);
        let status = svc.sync_all().await.unwrap();
        assert!(status.master_present);

        let applied = svc
            .set_device_delay(&key(ANALOG).to_string().to_uppercase(), 200)
            .await
            .unwrap();
        assert_eq!(applied, 200);
        assert_eq!(fake.loopbacks_to(ANALOG)[0].loopback_latency_ms(), 200);

        assert_eq!(
            svc.set_device_enabled("bt:00:00:00:00:00:00", false).await,
            Err(DaemonError::DeviceNotFound("bt:00:00:00:00:00:00".to_string()))
        );
        svc.shutdown();
        assert!(fake.has_sink("audio_master"));
    }

    #[tokio::test]
    async fn test_cleanup_on_exit() {
        let (fake, svc) = service(true);
        svc.sync_all().await.unwrap();
        svc.shutdown();
        assert!(!fake.has_sink("audio_master"));
    }
}
