// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! AudioSync Daemon - keeps every output device playing the same audio in sync.
//!
//! The daemon owns a master null sink and one delay-compensated loopback per
//! physical output, reconciles them against the live audio server, and
//! exposes a D-Bus interface for the CLI.

mod audio;
mod config;
mod dbus;
mod service;
mod sync;

use audiosync_ipc::{DBUS_NAME, DBUS_PATH};
use dbus::DaemonDbusService;
use service::{SignalEvent, SyncService};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{debug, info, warn};
use zbus::connection::Builder;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("audiosync_daemon=debug".parse().unwrap())
                .add_directive("zbus=warn".parse().unwrap()),
        )
        .init();

    info!("AudioSync Daemon starting...");
    audio::pactl::check_pactl();

    // Load configuration
    let config_manager = config::ConfigManager::new()?;
    let sync_config = config_manager.load().unwrap_or_else(|e| {
        warn!("Failed to load config, using defaults: {}", e);
        config::SyncConfig::default()
    });

    info!(
        "Loaded config: master '{}', {} known devices",
        sync_config.master_sink,
        sync_config.devices.len()
    );

    // Create signal channel for D-Bus signal events
    let (signal_tx, signal_rx) = tokio_mpsc::unbounded_channel::<SignalEvent>();

    // Start the sync thread; it runs the first full pass on its own.
    let service = Arc::new(SyncService::start(config_manager, sync_config, signal_tx)?);

    // Create D-Bus interface
    let dbus_service = DaemonDbusService::new(service.clone());

    // Build D-Bus connection
    let connection = Builder::session()?
        .name(DBUS_NAME)?
        .serve_at(DBUS_PATH, dbus_service)?
        .build()
        .await?;

    info!("D-Bus service registered at {}", DBUS_NAME);
    info!("AudioSync Daemon ready");

    // Shutdown flag for graceful termination
    let shutdown_flag = Arc::new(AtomicBool::new(false));

    // Spawn task to emit D-Bus signals from the signal channel
    let shutdown_flag_signals = shutdown_flag.clone();
    let signal_connection = connection.clone();
    let signal_task = tokio::spawn(async move {
        let mut signal_rx = signal_rx;
        loop {
            tokio::select! {
                Some(event) = signal_rx.recv() => {
                    let object_server = signal_connection.object_server();
                    let iface_ref = match object_server.interface::<_, DaemonDbusService>(DBUS_PATH).await {
                        Ok(iface) => iface,
                        Err(e) => {
                            warn!("Failed to get D-Bus interface for signal: {}", e);
                            continue;
                        }
                    };
                    let ctx = iface_ref.signal_context();
                    match event {
                        SignalEvent::StatusChanged(status) => {
                            debug!(
                                "Emitting D-Bus StatusChanged signal: {} ({}/{} synced)",
                                status.health,
                                status.synced_count(),
                                status.devices.len()
                            );
                            if let Err(e) = dbus::emit_status_changed(ctx, status).await {
                                warn!("Failed to emit StatusChanged signal: {}", e);
                            }
                        }
                    }
                }
                _ = tokio::time::sleep(tokio::time::Duration::from_millis(100)) => {
                    if shutdown_flag_signals.load(Ordering::Relaxed) {
                        break;
                    }
                }
            }
        }
    });

    // Handle shutdown signals
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down...");
        }
    }

    // Signal the task to stop
    shutdown_flag.store(true, Ordering::Relaxed);
    let _ = tokio::time::timeout(tokio::time::Duration::from_secs(1), signal_task).await;

    // Drop the interface so the service is uniquely owned again.
    if let Err(e) = connection
        .object_server()
        .remove::<DaemonDbusService, _>(DBUS_PATH)
        .await
    {
        warn!("Failed to unregister D-Bus interface: {}", e);
    }
    drop(connection);

    match Arc::try_unwrap(service) {
        Ok(svc) => tokio::task::spawn_blocking(move || svc.shutdown()).await?,
        Err(_) => warn!("Service still referenced, skipping orderly shutdown"),
    }

    info!("AudioSync Daemon stopped");
    Ok(())
}
