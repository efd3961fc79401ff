// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! In-memory audio server for tests.
//!
//! Clones share state, so a test can keep a handle while the engine owns another.

use crate::audio::server::{AudioServer, ServerCapabilities, ServerError, ServerResult};
use crate::audio::types::{
    monitor_of, ModuleHandle, ModuleKind, ModuleRecord, ServerFamily, ServerInfo,
    SinkInputRecord, SinkRecord,
};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

/// A mutating call, in the order the engine issued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    CreateNullSink(String),
    CreateLoopback {
        source: String,
        sink: String,
        latency_ms: u32,
    },
    RemoveModule(u32),
    SetDefaultSink(String),
    MoveSinkInput(u32, String),
    SetSinkMute(String, bool),
    SetSinkVolume(String, u32),
    ResetServerState,
}

impl Op {
    pub fn is_create_loopback(&self) -> bool {
        matches!(self, Op::CreateLoopback { .. })
    }
}

#[derive(Debug, Default)]
struct FakeState {
    sinks: Vec<SinkRecord>,
    modules: Vec<ModuleRecord>,
    sink_inputs: Vec<SinkInputRecord>,
    default_sink: Option<String>,
    next_id: u32,
    ops: Vec<Op>,

    unavailable: bool,
    reject_loopback_to: BTreeSet<String>,
    timeout_loopback_to: BTreeSet<String>,
    drop_loopback_to: BTreeSet<String>,
    vanish_on_loopback_to: BTreeSet<String>,
    reject_remove: BTreeSet<u32>,
    stall_module_listing: bool,
}

impl FakeState {
    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn check_available(&self) -> ServerResult<()> {
        if self.unavailable {
            Err(ServerError::ServerUnavailable("Connection refused".to_string()))
        } else {
            Ok(())
        }
    }

    fn remove_module_cascade(&mut self, id: u32) {
        let provided: Vec<String> = self
            .sinks
            .iter()
            .filter(|s| s.owner_module == Some(id))
            .map(|s| s.name.clone())
            .collect();
        self.modules.retain(|m| m.id != id);
        self.sinks.retain(|s| s.owner_module != Some(id));

        // Loopbacks are loaded with *_dont_move, so they go away with either end.
        for sink in provided {
            let monitor = monitor_of(&sink);
            self.modules.retain(|m| {
                m.loopback_source() != Some(monitor.as_str())
                    && m.loopback_target() != Some(sink.as_str())
            });
            if self.default_sink.as_deref() == Some(sink.as_str()) {
                self.default_sink = None;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct FakeServer {
    state: Arc<Mutex<FakeState>>,
    caps: ServerCapabilities,
}

impl Default for FakeServer {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeServer {
    pub fn new() -> Self {
        Self::with_family(ServerFamily::PulseAudio, &[])
    }

    pub fn with_family(family: ServerFamily, state_reset_command: &[String]) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                next_id: 100,
                ..Default::default()
            })),
            caps: ServerCapabilities::for_family(family, state_reset_command),
        }
    }

    /// Add a hardware sink; returns its index.
    pub fn add_sink(&self, name: &str, description: &str) -> u32 {
        let mut state = self.state.lock();
        let id = state.alloc_id();
        state
            .sinks
            .push(SinkRecord::new(id, name).with_description(description));
        id
    }

    /// Unplug a hardware sink; loopbacks targeting it are unloaded with it.
    pub fn unplug(&self, name: &str) {
        let mut state = self.state.lock();
        state.sinks.retain(|s| s.name != name);
        state
            .modules
            .retain(|m| m.loopback_target() != Some(name));
        if state.default_sink.as_deref() == Some(name) {
            state.default_sink = None;
        }
    }

    /// Drop a sink from enumeration but leave modules that reference it.
    pub fn unplug_keep_modules(&self, name: &str) {
        self.state.lock().sinks.retain(|s| s.name != name);
    }

    /// Insert a loopback directly, bypassing the op log.
    pub fn preload_loopback(&self, source: &str, sink: &str, latency_ms: u32) -> u32 {
        let mut state = self.state.lock();
        let id = state.alloc_id();
        let args = format!("source={} sink={} latency_msec={}", source, sink, latency_ms);
        state
            .modules
            .push(ModuleRecord::new(id, ModuleKind::Loopback, &args));
        id
    }

    /// Insert a null sink directly, bypassing the op log.
    pub fn preload_null_sink(&self, name: &str) -> u32 {
        let mut state = self.state.lock();
        let module_id = state.alloc_id();
        let args = format!("sink_name={}", name);
        state
            .modules
            .push(ModuleRecord::new(module_id, ModuleKind::NullSink, &args));
        let sink_id = state.alloc_id();
        let mut sink = SinkRecord::new(sink_id, name);
        sink.owner_module = Some(module_id);
        state.sinks.push(sink);
        module_id
    }

    pub fn add_sink_input(&self, input: SinkInputRecord) {
        self.state.lock().sink_inputs.push(input);
    }

    pub fn set_default(&self, name: &str) {
        self.state.lock().default_sink = Some(name.to_string());
    }

    pub fn default_sink(&self) -> Option<String> {
        self.state.lock().default_sink.clone()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    pub fn reject_loopback_to(&self, sink: &str) {
        self.state.lock().reject_loopback_to.insert(sink.to_string());
    }

    pub fn timeout_loopback_to(&self, sink: &str) {
        self.state.lock().timeout_loopback_to.insert(sink.to_string());
    }

    /// Report success for loopbacks to `sink` without loading anything.
    pub fn drop_loopback_to(&self, sink: &str) {
        self.state.lock().drop_loopback_to.insert(sink.to_string());
    }

    /// Make `sink` disappear when a loopback to it is requested.
    pub fn vanish_on_loopback_to(&self, sink: &str) {
        self.state.lock().vanish_on_loopback_to.insert(sink.to_string());
    }

    pub fn reject_remove(&self, module_id: u32) {
        self.state.lock().reject_remove.insert(module_id);
    }

    /// Make `list_modules` time out, as a hung server does.
    pub fn stall_module_listing(&self, stalled: bool) {
        self.state.lock().stall_module_listing = stalled;
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.unavailable = false;
        state.reject_loopback_to.clear();
        state.timeout_loopback_to.clear();
        state.drop_loopback_to.clear();
        state.vanish_on_loopback_to.clear();
        state.reject_remove.clear();
        state.stall_module_listing = false;
    }

    pub fn ops(&self) -> Vec<Op> {
        self.state.lock().ops.clone()
    }

    pub fn take_ops(&self) -> Vec<Op> {
        std::mem::take(&mut self.state.lock().ops)
    }

    pub fn modules(&self) -> Vec<ModuleRecord> {
        self.state.lock().modules.clone()
    }

    pub fn sink_inputs(&self) -> Vec<SinkInputRecord> {
        self.state.lock().sink_inputs.clone()
    }

    /// Loopbacks currently loaded that target `sink`.
    pub fn loopbacks_to(&self, sink: &str) -> Vec<ModuleRecord> {
        self.state
            .lock()
            .modules
            .iter()
            .filter(|m| m.loopback_target() == Some(sink))
            .cloned()
            .collect()
    }

    pub fn has_sink(&self, name: &str) -> bool {
        self.state.lock().sinks.iter().any(|s| s.name == name)
    }
}

impl AudioServer for FakeServer {
    fn server_info(&self) -> ServerResult<ServerInfo> {
        let state = self.state.lock();
        state.check_available()?;
        Ok(ServerInfo {
            server_name: match self.caps.family {
                ServerFamily::PulseAudio => "pulseaudio".to_string(),
                ServerFamily::PipeWire => "PulseAudio (on PipeWire 1.0.5)".to_string(),
            },
            server_version: "fake".to_string(),
            default_sink: state.default_sink.clone(),
            family: self.caps.family,
        })
    }

    fn list_sinks(&self) -> ServerResult<Vec<SinkRecord>> {
        let state = self.state.lock();
        state.check_available()?;
        Ok(state.sinks.clone())
    }

    fn list_modules(&self) -> ServerResult<Vec<ModuleRecord>> {
        let state = self.state.lock();
        state.check_available()?;
        if state.stall_module_listing {
            return Err(ServerError::Timeout(
                5000,
                "pactl list short modules".to_string(),
            ));
        }
        Ok(state.modules.clone())
    }

    fn list_sink_inputs(&self) -> ServerResult<Vec<SinkInputRecord>> {
        let state = self.state.lock();
        state.check_available()?;
        Ok(state.sink_inputs.clone())
    }

    fn create_null_sink(&self, name: &str, _description: &str) -> ServerResult<ModuleHandle> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.ops.push(Op::CreateNullSink(name.to_string()));
        drop(state);
        Ok(ModuleHandle(self.preload_null_sink(name)))
    }

    fn create_loopback(
        &self,
        source_monitor: &str,
        target_sink: &str,
        latency_ms: u32,
    ) -> ServerResult<ModuleHandle> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.ops.push(Op::CreateLoopback {
            source: source_monitor.to_string(),
            sink: target_sink.to_string(),
            latency_ms,
        });

        if state.vanish_on_loopback_to.contains(target_sink) {
            state.sinks.retain(|s| s.name != target_sink);
            return Err(ServerError::OperationRejected(format!(
                "load-module module-loopback: sink {} does not exist",
                target_sink
            )));
        }
        if state.reject_loopback_to.contains(target_sink) {
            return Err(ServerError::OperationRejected(
                "load-module module-loopback: Module initialization failed".to_string(),
            ));
        }
        if state.timeout_loopback_to.contains(target_sink) {
            return Err(ServerError::Timeout(
                5000,
                format!("pactl load-module module-loopback sink={}", target_sink),
            ));
        }
        if !state.sinks.iter().any(|s| s.name == target_sink) {
            return Err(ServerError::OperationRejected(format!(
                "load-module module-loopback: sink {} does not exist",
                target_sink
            )));
        }

        let id = state.alloc_id();
        if !state.drop_loopback_to.contains(target_sink) {
            let mut args = format!(
                "source={} sink={} latency_msec={}",
                source_monitor, target_sink, latency_ms
            );
            for extra in &self.caps.loopback_args {
                args.push(' ');
                args.push_str(extra);
            }
            state
                .modules
                .push(ModuleRecord::new(id, ModuleKind::Loopback, &args));
        }
        Ok(ModuleHandle(id))
    }

    fn remove_module(&self, id: u32) -> ServerResult<()> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.ops.push(Op::RemoveModule(id));
        if state.reject_remove.contains(&id) {
            return Err(ServerError::OperationRejected(format!(
                "unload-module {}: Access denied",
                id
            )));
        }
        state.remove_module_cascade(id);
        Ok(())
    }

    fn set_default_sink(&self, name: &str) -> ServerResult<()> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.ops.push(Op::SetDefaultSink(name.to_string()));
        if !state.sinks.iter().any(|s| s.name == name) {
            return Err(ServerError::OperationRejected(format!(
                "set-default-sink {}: No such entity",
                name
            )));
        }
        state.default_sink = Some(name.to_string());
        Ok(())
    }

    fn move_sink_input(&self, input_id: u32, sink: &str) -> ServerResult<()> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.ops.push(Op::MoveSinkInput(input_id, sink.to_string()));
        let sink_id = state
            .sinks
            .iter()
            .find(|s| s.name == sink)
            .map(|s| s.id)
            .ok_or_else(|| ServerError::OperationRejected(format!("No such sink {}", sink)))?;
        match state.sink_inputs.iter_mut().find(|i| i.id == input_id) {
            Some(input) => {
                input.sink = Some(sink_id);
                Ok(())
            }
            None => Err(ServerError::OperationRejected(format!(
                "move-sink-input {}: No such entity",
                input_id
            ))),
        }
    }

    fn set_sink_mute(&self, sink: &str, muted: bool) -> ServerResult<()> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.ops.push(Op::SetSinkMute(sink.to_string(), muted));
        Ok(())
    }

    fn set_sink_volume(&self, sink: &str, percent: u32) -> ServerResult<()> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.ops.push(Op::SetSinkVolume(sink.to_string(), percent));
        Ok(())
    }

    fn reset_server_state(&self) -> ServerResult<()> {
        let mut state = self.state.lock();
        state.check_available()?;
        if self.caps.stale_module_cache {
            state.ops.push(Op::ResetServerState);
        }
        Ok(())
    }

    fn capabilities(&self) -> ServerCapabilities {
        self.caps.clone()
    }
}
