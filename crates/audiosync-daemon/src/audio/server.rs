// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Audio server control-plane contract.
//!
//! Every mutating call changes live system routing and may partially apply
//! before failing, so callers re-query instead of trusting a call's own result.

use crate::audio::types::{
    ModuleHandle, ModuleRecord, ServerFamily, ServerInfo, SinkInputRecord, SinkRecord,
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServerError {
    #[error("audio server unavailable: {0}")]
    ServerUnavailable(String),
    #[error("operation rejected: {0}")]
    OperationRejected(String),
    #[error("timed out after {0} ms: {1}")]
    Timeout(u64, String),
}

impl ServerError {
    /// Whether this failure ends the current reconciliation pass.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ServerUnavailable(_))
    }
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Family-specific behaviour, kept out of the reconciliation algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCapabilities {
    pub family: ServerFamily,
    /// Extra `key=value` arguments appended to every loopback module.
    pub loopback_args: Vec<String>,
    /// The session/device manager keeps stale module references that survive
    /// module unloads and must be cleared on reset.
    pub stale_module_cache: bool,
    /// Command that clears that cache.
    pub state_reset_command: Vec<String>,
}

impl ServerCapabilities {
    pub fn for_family(family: ServerFamily, state_reset_command: &[String]) -> Self {
        let mut loopback_args = vec![
            "source_dont_move=true".to_string(),
            "sink_dont_move=true".to_string(),
        ];
        match family {
            ServerFamily::PulseAudio => {
                // Native PulseAudio's adaptive resampler crackles on loopbacks.
                loopback_args.push("adjust_time=0".to_string());
                Self {
                    family,
                    loopback_args,
                    stale_module_cache: false,
                    state_reset_command: Vec::new(),
                }
            }
            ServerFamily::PipeWire => Self {
                family,
                loopback_args,
                stale_module_cache: !state_reset_command.is_empty(),
                state_reset_command: state_reset_command.to_vec(),
            },
        }
    }
}

/// Control-plane operations against a PulseAudio-protocol server.
pub trait AudioServer: Send {
    fn server_info(&self) -> ServerResult<ServerInfo>;
    fn list_sinks(&self) -> ServerResult<Vec<SinkRecord>>;
    fn list_modules(&self) -> ServerResult<Vec<ModuleRecord>>;
    fn list_sink_inputs(&self) -> ServerResult<Vec<SinkInputRecord>>;

    fn create_null_sink(&self, name: &str, description: &str) -> ServerResult<ModuleHandle>;
    fn create_loopback(
        &self,
        source_monitor: &str,
        target_sink: &str,
        latency_ms: u32,
    ) -> ServerResult<ModuleHandle>;
    /// Unloading an unknown module succeeds: it is already absent.
    fn remove_module(&self, id: u32) -> ServerResult<()>;
    fn set_default_sink(&self, name: &str) -> ServerResult<()>;
    fn move_sink_input(&self, input_id: u32, sink: &str) -> ServerResult<()>;
    fn set_sink_mute(&self, sink: &str, muted: bool) -> ServerResult<()>;
    fn set_sink_volume(&self, sink: &str, percent: u32) -> ServerResult<()>;

    /// Clear cached device-manager state. No-op when the capabilities say the
    /// server has no such cache.
    fn reset_server_state(&self) -> ServerResult<()>;

    fn capabilities(&self) -> ServerCapabilities;
}
