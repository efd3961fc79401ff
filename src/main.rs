// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! AudioSync - play the same audio on every output device, in sync.
//!
//! Command-line client for the AudioSync daemon.

mod daemon_client;
mod display;

use clap::{Parser, Subcommand};
use daemon_client::DaemonClient;
use futures::StreamExt;
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "audiosync")]
#[command(author, version, about = "Synchronized multi-device audio output", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the verified state of the master sink and every device
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Resume syncing and reconcile every device now
    Sync,

    /// Set a device's compensation delay in milliseconds
    Delay {
        /// Device key as shown by `status` (e.g. bt:aa:bb:cc:dd:ee:ff)
        key: String,
        /// Delay in milliseconds (clamped to 1-500)
        delay_ms: u32,
    },

    /// Add a device to the sync group
    Enable { key: String },

    /// Remove a device from the sync group
    Disable { key: String },

    /// Remove all loopbacks and the master sink, and pause syncing
    Cleanup,

    /// Tear everything down and rebuild from scratch
    Reset,

    /// Forget devices that are not currently connected
    Forget,

    /// Print status changes as the daemon reports them
    Watch,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("audiosync=warn".parse().unwrap()))
        .init();

    let cli = Cli::parse();
    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("audiosync: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    let client = DaemonClient::connect().await?;

    match command {
        Commands::Status { json } => {
            let status = client.get_status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print!("{}", display::format_status(&status));
            }
        }
        Commands::Sync => {
            let status = client.sync_all().await?;
            println!("{}", display::format_outcome(&status));
        }
        Commands::Delay { key, delay_ms } => {
            let applied = client.set_device_delay(&key, delay_ms).await?;
            if applied != delay_ms {
                println!("{}: delay clamped to {} ms", key, applied);
            } else {
                println!("{}: delay set to {} ms", key, applied);
            }
        }
        Commands::Enable { key } => {
            client.set_device_enabled(&key, true).await?;
            println!("{}: enabled", key);
        }
        Commands::Disable { key } => {
            client.set_device_enabled(&key, false).await?;
            println!("{}: disabled", key);
        }
        Commands::Cleanup => {
            client.cleanup().await?;
            println!("Routing removed; syncing paused until `audiosync sync`");
        }
        Commands::Reset => {
            let status = client.reset().await?;
            println!("{}", display::format_outcome(&status));
        }
        Commands::Forget => {
            let forgotten = client.forget_absent_devices().await?;
            if forgotten.is_empty() {
                println!("No absent devices");
            }
            for key in forgotten {
                println!("Forgot {}", key);
            }
        }
        Commands::Watch => {
            let mut updates = Box::pin(client.status_updates().await?);
            print!("{}", display::format_status(&client.get_status().await?));
            while let Some(status) = updates.next().await {
                println!();
                print!("{}", display::format_status(&status));
            }
        }
    }
    Ok(())
}
