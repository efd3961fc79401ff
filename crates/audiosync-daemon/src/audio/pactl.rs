// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! `AudioServer` implementation driving the `pactl` CLI.
//!
//! Works against native PulseAudio and against PipeWire through pipewire-pulse.

use crate::audio::parse;
use crate::audio::server::{AudioServer, ServerCapabilities, ServerError, ServerResult};
use crate::audio::types::{
    ModuleHandle, ModuleRecord, ServerFamily, ServerInfo, SinkInputRecord, SinkRecord,
};
use parking_lot::RwLock;
use std::io::Read;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const PACTL: &str = "pactl";
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Log a warning if `pactl` is missing from PATH.
pub fn check_pactl() {
    match Command::new("which").arg(PACTL).output() {
        Ok(output) if output.status.success() => debug!("{} found", PACTL),
        _ => warn!(
            "'{}' not found in PATH. Install pulseaudio-utils (or pipewire-pulse) to control the audio server",
            PACTL
        ),
    }
}

/// Command with the C locale, so output labels and error strings are the
/// English ones the parsers match.
pub fn command(program: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.env("LC_ALL", "C");
    cmd
}

/// Run a command, killing it if it does not finish within `timeout`.
pub fn run_with_timeout(program: &str, args: &[String], timeout: Duration) -> ServerResult<Output> {
    let describe = || format!("{} {}", program, args.join(" "));

    let mut child = command(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ServerError::ServerUnavailable(format!("{} not found", program))
            } else {
                ServerError::ServerUnavailable(format!("failed to spawn {}: {}", program, e))
            }
        })?;

    // Drain pipes on helper threads so large listings cannot fill the pipe
    // buffer and stall the child.
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_reader = thread::spawn(move || read_all(stdout));
    let stderr_reader = thread::spawn(move || read_all(stderr));

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                warn!("Command timed out after {:?}: {}", timeout, describe());
                return Err(ServerError::Timeout(timeout.as_millis() as u64, describe()));
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                return Err(ServerError::ServerUnavailable(format!(
                    "failed to wait for {}: {}",
                    describe(),
                    e
                )))
            }
        }
    };

    Ok(Output {
        status,
        stdout: stdout_reader.join().unwrap_or_default(),
        stderr: stderr_reader.join().unwrap_or_default(),
    })
}

fn read_all<R: Read>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    buf
}

/// Map a failed `pactl` invocation onto the error taxonomy.
fn classify_failure(command: &str, stderr: &str) -> ServerError {
    let stderr = stderr.trim();
    let unreachable = [
        "Connection failure",
        "Connection refused",
        "Connection terminated",
        "pa_context_connect() failed",
    ];
    if unreachable.iter().any(|s| stderr.contains(s)) {
        ServerError::ServerUnavailable(stderr.to_string())
    } else {
        ServerError::OperationRejected(format!("{}: {}", command, stderr))
    }
}

fn is_missing_entity(stderr: &str) -> bool {
    stderr.contains("No such entity") || stderr.contains("does not exist")
}

/// `pactl`-backed audio server client.
pub struct PactlClient {
    timeout: Duration,
    family_override: Option<ServerFamily>,
    state_reset_command: Vec<String>,
    caps: RwLock<ServerCapabilities>,
}

impl PactlClient {
    pub fn new(
        timeout: Duration,
        family_override: Option<ServerFamily>,
        state_reset_command: Vec<String>,
    ) -> Self {
        let family = family_override.unwrap_or(ServerFamily::PulseAudio);
        let caps = ServerCapabilities::for_family(family, &state_reset_command);
        Self {
            timeout,
            family_override,
            state_reset_command,
            caps: RwLock::new(caps),
        }
    }

    /// Run `pactl` and return stdout on success.
    fn pactl(&self, args: &[String]) -> ServerResult<String> {
        let command = format!("pactl {}", args.join(" "));
        debug!("{}", command);

        let output = run_with_timeout(PACTL, args, self.timeout)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&command, &stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn pactl_str(&self, args: &[&str]) -> ServerResult<String> {
        let owned: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.pactl(&owned)
    }

    fn load_module(&self, args: Vec<String>) -> ServerResult<ModuleHandle> {
        let stdout = self.pactl(&args)?;
        parse::parse_module_index(&stdout)
            .map(ModuleHandle)
            .ok_or_else(|| {
                ServerError::OperationRejected(format!(
                    "pactl {} printed no module index",
                    args.join(" ")
                ))
            })
    }

    fn update_capabilities(&self, detected: ServerFamily) -> ServerFamily {
        let family = self.family_override.unwrap_or(detected);
        let mut caps = self.caps.write();
        if caps.family != family {
            info!("Audio server family: {}", family.as_str());
            *caps = ServerCapabilities::for_family(family, &self.state_reset_command);
        }
        family
    }
}

impl AudioServer for PactlClient {
    fn server_info(&self) -> ServerResult<ServerInfo> {
        let stdout = self.pactl_str(&["info"])?;
        let mut info = parse::parse_server_info(&stdout).ok_or_else(|| {
            ServerError::ServerUnavailable("unrecognized `pactl info` output".to_string())
        })?;
        info.family = self.update_capabilities(info.family);
        Ok(info)
    }

    fn list_sinks(&self) -> ServerResult<Vec<SinkRecord>> {
        let stdout = self.pactl_str(&["list", "sinks"])?;
        Ok(parse::parse_sinks(&stdout))
    }

    fn list_modules(&self) -> ServerResult<Vec<ModuleRecord>> {
        let stdout = self.pactl_str(&["list", "short", "modules"])?;
        Ok(parse::parse_short_modules(&stdout))
    }

    fn list_sink_inputs(&self) -> ServerResult<Vec<SinkInputRecord>> {
        let stdout = self.pactl_str(&["list", "sink-inputs"])?;
        Ok(parse::parse_sink_inputs(&stdout))
    }

    fn create_null_sink(&self, name: &str, description: &str) -> ServerResult<ModuleHandle> {
        info!("Creating null sink '{}'", name);
        let description = description.replace('"', "");
        self.load_module(vec![
            "load-module".to_string(),
            "module-null-sink".to_string(),
            format!("sink_name={}", name),
            format!("sink_properties=device.description=\"{}\"", description),
        ])
    }

    fn create_loopback(
        &self,
        source_monitor: &str,
        target_sink: &str,
        latency_ms: u32,
    ) -> ServerResult<ModuleHandle> {
        info!(
            "Creating loopback {} -> {} ({} ms)",
            source_monitor, target_sink, latency_ms
        );
        let mut args = vec![
            "load-module".to_string(),
            "module-loopback".to_string(),
            format!("source={}", source_monitor),
            format!("sink={}", target_sink),
            format!("latency_msec={}", latency_ms),
        ];
        args.extend(self.caps.read().loopback_args.iter().cloned());
        self.load_module(args)
    }

    fn remove_module(&self, id: u32) -> ServerResult<()> {
        info!("Unloading module {}", id);
        match self.pactl(&["unload-module".to_string(), id.to_string()]) {
            Ok(_) => Ok(()),
            Err(ServerError::OperationRejected(msg)) if is_missing_entity(&msg) => {
                debug!("Module {} already absent", id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn set_default_sink(&self, name: &str) -> ServerResult<()> {
        info!("Setting default sink to '{}'", name);
        self.pactl_str(&["set-default-sink", name]).map(|_| ())
    }

    fn move_sink_input(&self, input_id: u32, sink: &str) -> ServerResult<()> {
        debug!("Moving sink input {} to '{}'", input_id, sink);
        self.pactl(&[
            "move-sink-input".to_string(),
            input_id.to_string(),
            sink.to_string(),
        ])
        .map(|_| ())
    }

    fn set_sink_mute(&self, sink: &str, muted: bool) -> ServerResult<()> {
        self.pactl_str(&["set-sink-mute", sink, if muted { "1" } else { "0" }])
            .map(|_| ())
    }

    fn set_sink_volume(&self, sink: &str, percent: u32) -> ServerResult<()> {
        self.pactl(&[
            "set-sink-volume".to_string(),
            sink.to_string(),
            format!("{}%", percent),
        ])
        .map(|_| ())
    }

    fn reset_server_state(&self) -> ServerResult<()> {
        let caps = self.capabilities();
        let Some((program, args)) = caps.state_reset_command.split_first() else {
            return Ok(());
        };
        if !caps.stale_module_cache {
            return Ok(());
        }

        info!("Clearing session manager state: {}", caps.state_reset_command.join(" "));
        let output = run_with_timeout(program, args, self.timeout)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ServerError::OperationRejected(format!(
                "{}: {}",
                caps.state_reset_command.join(" "),
                stderr.trim()
            )));
        }
        Ok(())
    }

    fn capabilities(&self) -> ServerCapabilities {
        self.caps.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_unreachable() {
        let err = classify_failure("pactl info", "Connection failure: Connection refused\n");
        assert!(matches!(err, ServerError::ServerUnavailable(_)));
    }

    #[test]
    fn test_classify_rejected() {
        let err = classify_failure("pactl load-module module-loopback", "Failure: Module initialization failed");
        match err {
            ServerError::OperationRejected(msg) => {
                assert!(msg.starts_with("pactl load-module"));
                assert!(msg.contains("Module initialization failed"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_entity() {
        assert!(is_missing_entity("pactl unload-module 9: Failure: No such entity"));
        assert!(!is_missing_entity("Failure: Access denied"));
    }

    #[test]
    fn test_missing_binary_is_unavailable() {
        let err = run_with_timeout("audiosync-no-such-binary", &[], Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, ServerError::ServerUnavailable(_)));
    }

    #[test]
    fn test_slow_command_times_out() {
        let err = run_with_timeout("sleep", &["5".to_string()], Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, ServerError::Timeout(100, _)));
    }

    #[test]
    fn test_commands_use_c_locale() {
        let cmd = command(PACTL);
        let lc_all = cmd
            .get_envs()
            .find(|(key, _)| *key == "LC_ALL")
            .and_then(|(_, value)| value);
        assert_eq!(lc_all, Some(std::ffi::OsStr::new("C")));
    }

    #[test]
    fn test_family_override_sticks() {
        let client = PactlClient::new(
            Duration::from_secs(1),
            Some(ServerFamily::PipeWire),
            vec!["true".to_string()],
        );
        assert_eq!(client.update_capabilities(ServerFamily::PulseAudio), ServerFamily::PipeWire);
        assert!(client.capabilities().stale_module_cache);
    }

    #[test]
    #[ignore] // Requires a running audio server
    fn test_list_sinks_live() {
        let client = PactlClient::new(Duration::from_secs(5), None, Vec::new());
        let info = client.server_info().unwrap();
        assert!(!info.server_name.is_empty());
        let _ = client.list_sinks().unwrap();
    }
}
