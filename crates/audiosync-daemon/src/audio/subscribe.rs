// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Audio server change notifications via `pactl subscribe`.

use crate::audio::pactl;
use parking_lot::Mutex;
use std::io::{BufRead, BufReader};
use std::process::{Child, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    New,
    Change,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facility {
    Sink,
    Card,
    Module,
    Server,
    Other,
}

/// One line of `pactl subscribe` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerEvent {
    pub kind: EventKind,
    pub facility: Facility,
    pub index: Option<u32>,
}

impl ServerEvent {
    /// Parse `Event 'new' on sink #58` / `Event 'change' on server`.
    pub fn parse(line: &str) -> Option<Self> {
        let rest = line.trim().strip_prefix("Event '")?;
        let (kind, rest) = rest.split_once("' on ")?;
        let kind = match kind {
            "new" => EventKind::New,
            "change" => EventKind::Change,
            "remove" => EventKind::Remove,
            _ => return None,
        };

        let (facility, index) = match rest.split_once(" #") {
            Some((f, idx)) => (f, idx.trim().parse().ok()),
            None => (rest.trim(), None),
        };
        let facility = match facility {
            "sink" => Facility::Sink,
            "card" => Facility::Card,
            "module" => Facility::Module,
            "server" => Facility::Server,
            _ => Facility::Other,
        };

        Some(Self {
            kind,
            facility,
            index,
        })
    }

    /// Whether the event can change the device set or the routing topology.
    /// Sink `change` events fire on every volume tweak and are ignored.
    pub fn affects_topology(&self) -> bool {
        match (self.facility, self.kind) {
            (Facility::Sink, EventKind::New | EventKind::Remove) => true,
            (Facility::Card, _) => true,
            (Facility::Module, EventKind::Remove) => true,
            (Facility::Server, EventKind::Change) => true,
            _ => false,
        }
    }
}

/// Background reader for `pactl subscribe`, restarted with backoff when it exits.
pub struct EventSubscriber {
    shutdown: Arc<AtomicBool>,
    child: Arc<Mutex<Option<Child>>>,
    handle: Option<JoinHandle<()>>,
}

impl EventSubscriber {
    pub fn spawn<F>(on_event: F) -> std::io::Result<Self>
    where
        F: Fn(ServerEvent) + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let child: Arc<Mutex<Option<Child>>> = Arc::new(Mutex::new(None));

        let shutdown_thread = shutdown.clone();
        let child_thread = child.clone();
        let handle = thread::Builder::new()
            .name("audiosync-subscribe".to_string())
            .spawn(move || subscribe_loop(&shutdown_thread, &child_thread, &on_event))?;

        Ok(Self {
            shutdown,
            child,
            handle: Some(handle),
        })
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(mut child) = self.child.lock().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EventSubscriber {
    fn drop(&mut self) {
        self.stop();
    }
}

fn backoff(failures: u32) -> Duration {
    Duration::from_secs((2u64 << failures.min(4)).min(30))
}

fn subscribe_loop<F>(shutdown: &AtomicBool, child_slot: &Mutex<Option<Child>>, on_event: &F)
where
    F: Fn(ServerEvent),
{
    let mut failures = 0u32;

    while !shutdown.load(Ordering::Relaxed) {
        let spawned = pactl::command("pactl")
            .arg("subscribe")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                failures += 1;
                warn!("Failed to start pactl subscribe: {} (retry in {:?})", e, backoff(failures));
                sleep_unless_shutdown(shutdown, backoff(failures));
                continue;
            }
        };

        let stdout = child.stdout.take();
        *child_slot.lock() = Some(child);
        info!("Subscribed to audio server events");

        // A stop that raced the spawn found an empty slot.
        if shutdown.load(Ordering::Relaxed) {
            if let Some(mut child) = child_slot.lock().take() {
                let _ = child.kill();
                let _ = child.wait();
            }
            break;
        }

        let mut saw_event = false;
        if let Some(stdout) = stdout {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if let Some(event) = ServerEvent::parse(&line) {
                    saw_event = true;
                    if event.affects_topology() {
                        debug!("Server event: {:?}", event);
                        on_event(event);
                    }
                }
            }
        }

        if let Some(mut child) = child_slot.lock().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        failures = if saw_event { 1 } else { failures + 1 };
        warn!(
            "pactl subscribe exited, restarting in {:?}",
            backoff(failures)
        );
        sleep_unless_shutdown(shutdown, backoff(failures));
    }
}

fn sleep_unless_shutdown(shutdown: &AtomicBool, total: Duration) {
    let step = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while waited < total && !shutdown.load(Ordering::Relaxed) {
        thread::sleep(step);
        waited += step;
    }
}
