// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! D-Bus client for communicating with the AudioSync daemon.

use audiosync_ipc::{DeviceInfo, EngineStatus};
use futures::{Stream, StreamExt};
use tracing::{debug, info};
use zbus::{proxy, Connection, Result as ZbusResult};

/// D-Bus proxy for the daemon interface.
#[proxy(
    interface = "com.audiosync.Daemon",
    default_service = "com.audiosync.Daemon",
    default_path = "/com/audiosync/Daemon"
)]
trait Daemon {
    // Methods
    fn sync_all(&self) -> ZbusResult<EngineStatus>;
    fn set_device_delay(&self, key: &str, delay_ms: u32) -> ZbusResult<u32>;
    fn set_device_enabled(&self, key: &str, enabled: bool) -> ZbusResult<()>;
    fn cleanup(&self) -> ZbusResult<EngineStatus>;
    fn reset(&self) -> ZbusResult<EngineStatus>;
    fn forget_absent_devices(&self) -> ZbusResult<Vec<String>>;
    fn get_status(&self) -> ZbusResult<EngineStatus>;
    fn get_devices(&self) -> ZbusResult<Vec<DeviceInfo>>;

    // Signals
    #[zbus(signal)]
    fn status_changed(&self, status: EngineStatus) -> ZbusResult<()>;
}

/// Client for communicating with the AudioSync daemon.
pub struct DaemonClient {
    proxy: DaemonProxy<'static>,
}

impl DaemonClient {
    /// Connect to the daemon.
    pub async fn connect() -> Result<Self, DaemonClientError> {
        debug!("Connecting to AudioSync daemon...");

        let connection = Connection::session()
            .await
            .map_err(|e| DaemonClientError::ConnectionFailed(e.to_string()))?;

        let proxy = DaemonProxy::new(&connection)
            .await
            .map_err(|e| DaemonClientError::ProxyCreationFailed(e.to_string()))?;

        // Verify the daemon is running by calling a method
        if let Err(e) = proxy.get_status().await {
            return Err(DaemonClientError::DaemonNotRunning(e.to_string()));
        }

        info!("Connected to AudioSync daemon");
        Ok(Self { proxy })
    }

    pub async fn sync_all(&self) -> Result<EngineStatus, DaemonClientError> {
        self.proxy.sync_all().await.map_err(method_failed)
    }

    pub async fn set_device_delay(
        &self,
        key: &str,
        delay_ms: u32,
    ) -> Result<u32, DaemonClientError> {
        debug!("Setting delay of {} to {} ms", key, delay_ms);
        self.proxy
            .set_device_delay(key, delay_ms)
            .await
            .map_err(method_failed)
    }

    pub async fn set_device_enabled(
        &self,
        key: &str,
        enabled: bool,
    ) -> Result<(), DaemonClientError> {
        debug!("Setting {} enabled={}", key, enabled);
        self.proxy
            .set_device_enabled(key, enabled)
            .await
            .map_err(method_failed)
    }

    pub async fn cleanup(&self) -> Result<EngineStatus, DaemonClientError> {
        self.proxy.cleanup().await.map_err(method_failed)
    }

    pub async fn reset(&self) -> Result<EngineStatus, DaemonClientError> {
        self.proxy.reset().await.map_err(method_failed)
    }

    pub async fn forget_absent_devices(&self) -> Result<Vec<String>, DaemonClientError> {
        self.proxy.forget_absent_devices().await.map_err(method_failed)
    }

    pub async fn get_status(&self) -> Result<EngineStatus, DaemonClientError> {
        self.proxy.get_status().await.map_err(method_failed)
    }

    /// Stream of status snapshots pushed by the daemon.
    pub async fn status_updates(
        &self,
    ) -> Result<impl Stream<Item = EngineStatus>, DaemonClientError> {
        let stream = self
            .proxy
            .receive_status_changed()
            .await
            .map_err(|e| DaemonClientError::SignalSubscriptionFailed(e.to_string()))?;
        Ok(stream.filter_map(|signal| async move {
            signal.args().ok().map(|args| args.status)
        }))
    }
}

/// Strip zbus's error-name prefix so the daemon's message is shown as sent.
fn method_failed(e: zbus::Error) -> DaemonClientError {
    let message = match e {
        zbus::Error::MethodError(_, Some(detail), _) => detail,
        other => other.to_string(),
    };
    DaemonClientError::MethodCallFailed(message)
}

/// Errors that can occur when communicating with the daemon.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DaemonClientError {
    #[error("Failed to connect to D-Bus: {0}")]
    ConnectionFailed(String),
    #[error("Failed to create D-Bus proxy: {0}")]
    ProxyCreationFailed(String),
    #[error("Daemon is not running: {0}")]
    DaemonNotRunning(String),
    #[error("{0}")]
    MethodCallFailed(String),
    #[error("Signal subscription failed: {0}")]
    SignalSubscriptionFailed(String),
}
