// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! D-Bus interface implementation for the daemon.

use crate::service::SyncService;
use audiosync_ipc::{DeviceInfo, EngineStatus, DBUS_INTERFACE};
use std::sync::Arc;
use tracing::debug;
use zbus::interface;

/// Input validation helpers for D-Bus method arguments.
mod validate {
    use audiosync_ipc::DaemonError;

    /// Validate a device key: non-empty, max 256 chars, no control characters.
    pub fn validate_device_key(key: &str) -> Result<(), DaemonError> {
        if key.trim().is_empty() {
            return Err(DaemonError::InvalidArgument(
                "Device key must not be empty".into(),
            ));
        }
        if key.len() > 256 {
            return Err(DaemonError::InvalidArgument(format!(
                "Device key exceeds 256 character limit (got {})",
                key.len()
            )));
        }
        if key.chars().any(|c| c.is_control()) {
            return Err(DaemonError::InvalidArgument(
                "Device key must not contain control characters".into(),
            ));
        }
        Ok(())
    }
}

/// The D-Bus interface implementation.
pub struct DaemonDbusService {
    service: Arc<SyncService>,
}

impl DaemonDbusService {
    pub fn new(service: Arc<SyncService>) -> Self {
        Self { service }
    }
}

#[interface(name = "com.audiosync.Daemon")]
impl DaemonDbusService {
    // ==================== Sync Control ====================

    /// Resume syncing and run a full pass. Returns the verified status.
    async fn sync_all(&self) -> zbus::fdo::Result<EngineStatus> {
        debug!("D-Bus: sync_all");
        Ok(self.service.sync_all().await?)
    }

    /// Set a device's compensation delay. Returns the delay actually applied
    /// after clamping.
    async fn set_device_delay(&self, key: &str, delay_ms: u32) -> zbus::fdo::Result<u32> {
        validate::validate_device_key(key)?;
        debug!("D-Bus: set_device_delay({}, {})", key, delay_ms);
        Ok(self.service.set_device_delay(key, delay_ms).await?)
    }

    /// Include or exclude a device from the sync group.
    async fn set_device_enabled(&self, key: &str, enabled: bool) -> zbus::fdo::Result<()> {
        validate::validate_device_key(key)?;
        debug!("D-Bus: set_device_enabled({}, {})", key, enabled);
        Ok(self.service.set_device_enabled(key, enabled).await?)
    }

    /// Tear the routing graph down and pause syncing until SyncAll.
    async fn cleanup(&self) -> zbus::fdo::Result<EngineStatus> {
        debug!("D-Bus: cleanup");
        Ok(self.service.cleanup().await?)
    }

    /// Rebuild the routing graph from scratch.
    async fn reset(&self) -> zbus::fdo::Result<EngineStatus> {
        debug!("D-Bus: reset");
        Ok(self.service.reset().await?)
    }

    /// Forget every remembered device that is not currently present.
    async fn forget_absent_devices(&self) -> zbus::fdo::Result<Vec<String>> {
        debug!("D-Bus: forget_absent_devices");
        Ok(self.service.forget_absent_devices().await?)
    }

    // ==================== Queries ====================

    async fn get_status(&self) -> zbus::fdo::Result<EngineStatus> {
        Ok(self.service.status())
    }

    async fn get_devices(&self) -> zbus::fdo::Result<Vec<DeviceInfo>> {
        Ok(self.service.status().devices)
    }

    // ==================== Signals ====================

    /// Emitted whenever the verified engine status changes.
    #[zbus(signal)]
    async fn status_changed(ctx: &zbus::SignalContext<'_>, status: EngineStatus)
        -> zbus::Result<()>;
}

/// Emit StatusChanged from outside the interface methods.
pub async fn emit_status_changed(
    ctx: &zbus::SignalContext<'_>,
    status: EngineStatus,
) -> zbus::Result<()> {
    ctx.connection()
        .emit_signal(
            ctx.destination(),
            ctx.path(),
            DBUS_INTERFACE,
            "StatusChanged",
            &(status,),
        )
        .await
}
