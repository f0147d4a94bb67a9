//! An in-process stand-in for a real XRootD client binding, used only by
//! this crate's own test suite. Simulates several data servers with
//! independently configurable latency and failure injection, dispatching
//! every completion from a background OS thread via `crossbeam_channel` —
//! the same channel this crate's `tests/` integration suite uses for its
//! own thread coordination — so tests genuinely exercise cross-thread
//! completion delivery rather than faking it in-process.
//!
//! Gated behind the `test-util` feature (and always available under
//! `#[cfg(test)]`); see `lib.rs`.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Sender};
use log::debug;

use crate::wire::{
    AccessMode, IoOffset, IoSize, IoVec, OpenCallback, OpenFlags, ReadCallback, Wire, WireHandle, WireStatus,
};

/// Per-host simulated behavior: how long a read takes, and whether opens
/// or reads against this host should fail.
#[derive(Debug, Clone)]
pub struct HostProfile {
    pub latency: Duration,
    pub fail_open: bool,
    pub fail_reads: bool,
}

impl Default for HostProfile {
    fn default() -> Self {
        Self {
            latency: Duration::from_micros(100),
            fail_open: false,
            fail_reads: false,
        }
    }
}

/// A handle to one simulated data server.
#[derive(Debug, Clone)]
pub struct MockHandle {
    server_id: String,
}

impl WireHandle for MockHandle {
    fn server_id(&self) -> &str {
        &self.server_id
    }
}

enum Job {
    Open {
        candidates: Vec<String>,
        excluded: Vec<String>,
        on_done: OpenCallback<MockHandle>,
    },
    Read {
        host: String,
        latency: Duration,
        fail: bool,
        into: IoVec,
        on_done: ReadCallback,
    },
    ReadVector {
        host: String,
        latency: Duration,
        fail: bool,
        chunks: Vec<IoVec>,
        on_done: ReadCallback,
    },
}

struct Shared {
    hosts: Mutex<Vec<(String, HostProfile)>>,
}

/// The mock wire itself. Cheap to clone — every clone shares the same
/// background worker thread and host registry.
#[derive(Clone)]
pub struct MockWire {
    shared: Arc<Shared>,
    jobs: Sender<Job>,
}

impl MockWire {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            hosts: Mutex::new(Vec::new()),
        });
        let (tx, rx) = unbounded::<Job>();

        thread::spawn(move || {
            for job in rx {
                match job {
                    Job::Open {
                        candidates,
                        excluded,
                        on_done,
                    } => {
                        let chosen = candidates.into_iter().find(|candidate| !excluded.contains(candidate));
                        match chosen {
                            Some(server_id) => {
                                debug!("mock wire: opened '{}'", server_id);
                                on_done(Ok(MockHandle { server_id }));
                            }
                            None => on_done(Err(WireStatus::new("no candidate hosts available", libc_enoent(), -1))),
                        }
                    }
                    Job::Read {
                        host,
                        latency,
                        fail,
                        into,
                        on_done,
                    } => {
                        thread::sleep(latency);
                        if fail {
                            debug!("mock wire: read against '{}' failing (injected)", host);
                            on_done(Err(WireStatus::new("simulated read failure", libc_eio(), -1)));
                        } else {
                            // SAFETY: the manager only ever hands this `IoVec` to exactly
                            // one in-flight request, and the caller is contractually
                            // obligated to keep the buffer alive until that request's
                            // future resolves (see `IoVec`'s own safety docs).
                            unsafe { into.as_mut_slice() }.fill(0xAB);
                            on_done(Ok(into.size));
                        }
                    }
                    Job::ReadVector {
                        host,
                        latency,
                        fail,
                        chunks,
                        on_done,
                    } => {
                        thread::sleep(latency);
                        if fail {
                            debug!("mock wire: vector read against '{}' failing (injected)", host);
                            on_done(Err(WireStatus::new("simulated vector read failure", libc_eio(), -1)));
                        } else {
                            let mut total: IoSize = 0;
                            for chunk in &chunks {
                                unsafe { chunk.as_mut_slice() }.fill(0xAB);
                                total += chunk.size;
                            }
                            on_done(Ok(total));
                        }
                    }
                }
            }
        });

        Self { shared, jobs: tx }
    }

    /// Registers a candidate host the simulated redirector may hand out on
    /// open, in the order added (ties among non-excluded candidates are
    /// broken by registration order).
    pub fn add_host(&self, name: impl Into<String>, profile: HostProfile) {
        self.shared
            .hosts
            .lock()
            .expect("host list poisoned")
            .push((name.into(), profile));
    }

    /// Every host registered so far, in registration order. Lets tests
    /// build a `?tried=` exclusion list that forces `open_sync` to hand
    /// back one specific host among several registered candidates.
    pub fn registered_hosts(&self) -> Vec<String> {
        self.shared
            .hosts
            .lock()
            .expect("host list poisoned")
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn parse_tried(name: &str) -> Vec<String> {
        match name.split_once("?tried=") {
            Some((_, ids)) if !ids.is_empty() => ids.split(',').map(|s| s.to_owned()).collect(),
            _ => Vec::new(),
        }
    }

    fn profile_for(&self, host: &str) -> HostProfile {
        self.shared
            .hosts
            .lock()
            .expect("host list poisoned")
            .iter()
            .find(|(name, _)| name == host)
            .map(|(_, profile)| profile.clone())
            .unwrap_or_default()
    }
}

impl Default for MockWire {
    fn default() -> Self {
        Self::new()
    }
}

impl Wire for MockWire {
    type Handle = MockHandle;

    fn open_sync(&self, name: &str, _flags: OpenFlags, _mode: AccessMode) -> Result<MockHandle, WireStatus> {
        let excluded = Self::parse_tried(name);
        let hosts = self.shared.hosts.lock().expect("host list poisoned");
        let chosen = hosts
            .iter()
            .find(|(candidate, profile)| !excluded.contains(candidate) && !profile.fail_open)
            .map(|(candidate, _)| candidate.clone());
        drop(hosts);
        chosen
            .map(|server_id| MockHandle { server_id })
            .ok_or_else(|| WireStatus::new("no candidate hosts available", libc_enoent(), -1))
    }

    fn open_async(&self, name: &str, _flags: OpenFlags, _mode: AccessMode, on_done: OpenCallback<MockHandle>) {
        let excluded = Self::parse_tried(name);
        let candidates: Vec<String> = self
            .shared
            .hosts
            .lock()
            .expect("host list poisoned")
            .iter()
            .filter(|(_, profile)| !profile.fail_open)
            .map(|(name, _)| name.clone())
            .collect();
        let _ = self.jobs.send(Job::Open {
            candidates,
            excluded,
            on_done,
        });
    }

    fn read(&self, handle: &MockHandle, _offset: IoOffset, _size: IoSize, into: IoVec, on_done: ReadCallback) {
        let profile = self.profile_for(&handle.server_id);
        let _ = self.jobs.send(Job::Read {
            host: handle.server_id.clone(),
            latency: profile.latency,
            fail: profile.fail_reads,
            into,
            on_done,
        });
    }

    fn read_vector(&self, handle: &MockHandle, chunks: Vec<IoVec>, on_done: ReadCallback) {
        let profile = self.profile_for(&handle.server_id);
        let _ = self.jobs.send(Job::ReadVector {
            host: handle.server_id.clone(),
            latency: profile.latency,
            fail: profile.fail_reads,
            chunks,
            on_done,
        });
    }

    fn close(&self, handle: MockHandle) {
        debug!("mock wire: closing handle for '{}'", handle.server_id);
    }
}

// Avoids a hard `libc` dependency (dropped per `DESIGN.md`) just for two
// errno constants used in synthetic statuses.
fn libc_enoent() -> i32 {
    2
}

fn libc_eio() -> i32 {
    5
}
