//! Collection of terminated child processes.
//!
//! The reaper owns a registry of outstanding children and a background thread
//! woken by `SIGCHLD`. On every notification it polls *every* registered
//! child with a non-blocking `waitpid`, since several exits can coalesce
//! into a single signal. It never restarts anything and never blocks on a
//! child that is still running. Only registered children are waited on, so
//! independent reapers in one process never collect each other's children.
//!
//! Children are forked through [`ChildRegistry::fork`] with the registry lock
//! held, so a child can never be collected before it has been registered.

use signal_hook::consts::SIGCHLD;
use signal_hook::iterator::{Handle, Signals};
use std::collections::HashMap;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::worker::{Slot, WorkerHandle};

pub type Pid = libc::pid_t;

/// Why a child was forked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    /// Services exactly one connection, then exits.
    Session,
    /// Long-lived hybrid pool process.
    Pool,
}

/// Which side of a fork the caller is on.
#[derive(Debug, PartialEq, Eq)]
pub enum Forked {
    Parent(Pid),
    Child,
}

struct Child {
    kind: ChildKind,
    /// Worker slot released when the child is collected.
    _slot: Option<Slot>,
}

struct Registry {
    children: Mutex<HashMap<Pid, Child>>,
    reaped: Condvar,
}

/// Shared view of the outstanding-children registry.
#[derive(Clone)]
pub struct ChildRegistry {
    inner: Arc<Registry>,
}

impl ChildRegistry {
    fn new() -> Self {
        Self {
            inner: Arc::new(Registry {
                children: Mutex::new(HashMap::new()),
                reaped: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Pid, Child>> {
        self.inner
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Fork the current process and register the child.
    ///
    /// In the child the registry copy is left untouched and the slot is
    /// forgotten; it belongs to the parent.
    pub fn fork(&self, kind: ChildKind, slot: Option<Slot>) -> io::Result<Forked> {
        let mut children = self.lock();
        match unsafe { libc::fork() } {
            -1 => Err(io::Error::last_os_error()),
            0 => {
                drop(children);
                std::mem::forget(slot);
                Ok(Forked::Child)
            }
            pid => {
                if let Some(ref slot) = slot {
                    slot.bind(WorkerHandle::Process(pid));
                }
                children.insert(pid, Child { kind, _slot: slot });
                Ok(Forked::Parent(pid))
            }
        }
    }

    /// Collect every registered child that has already terminated.
    ///
    /// Returns the number of children collected.
    pub fn reap(&self) -> usize {
        let mut children = self.lock();

        let collected: Vec<(Pid, io::Result<ExitStatus>)> = children
            .keys()
            .filter_map(|&pid| match wait_nohang(pid) {
                Ok(None) => None,
                Ok(Some(status)) => Some((pid, Ok(status))),
                // ECHILD: collected by someone else, the entry is stale
                Err(e) => Some((pid, Err(e))),
            })
            .collect();

        // Logged under the registry lock so a concurrent fork never
        // inherits a held stdout lock.
        for (pid, result) in &collected {
            let Some(child) = children.remove(pid) else {
                continue;
            };
            match result {
                Ok(status) => debug!(pid, kind = ?child.kind, %status, "Reaped child"),
                Err(e) => warn!(pid, kind = ?child.kind, error = %e, "waitpid failed, dropping child"),
            }
        }

        drop(children);
        if !collected.is_empty() {
            self.inner.reaped.notify_all();
        }
        collected.len()
    }

    /// Number of registered children not yet collected.
    pub fn outstanding(&self) -> usize {
        self.lock().len()
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.lock().contains_key(&pid)
    }

    /// Block until none of `pids` is outstanding or `timeout` elapses.
    ///
    /// Returns `true` if every listed child was collected.
    pub fn wait_collected(&self, pids: &[Pid], timeout: Duration) -> bool {
        let children = self.lock();
        let (children, _) = self
            .inner
            .reaped
            .wait_timeout_while(children, timeout, |c| {
                pids.iter().any(|pid| c.contains_key(pid))
            })
            .unwrap_or_else(PoisonError::into_inner);
        !pids.iter().any(|pid| children.contains_key(pid))
    }
}

/// Non-blocking `waitpid` on one child. `Ok(None)` while it still runs.
fn wait_nohang(pid: Pid) -> io::Result<Option<ExitStatus>> {
    loop {
        let mut status: libc::c_int = 0;
        match unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) } {
            0 => return Ok(None),
            -1 => {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err);
                }
            }
            _ => return Ok(Some(ExitStatus::from_raw(status))),
        }
    }
}

struct Background {
    signals: Handle,
    thread: JoinHandle<()>,
}

/// Background collector for terminated children.
pub struct Reaper {
    registry: ChildRegistry,
    background: Option<Background>,
}

impl Reaper {
    /// Install the `SIGCHLD` notification and start the collector thread.
    pub fn start() -> io::Result<Self> {
        let registry = ChildRegistry::new();
        let mut signals = Signals::new([SIGCHLD])?;
        let handle = signals.handle();

        let thread = {
            let registry = registry.clone();
            thread::Builder::new()
                .name("reaper".to_string())
                .spawn(move || {
                    for _ in signals.forever() {
                        registry.reap();
                    }
                })?
        };

        info!("Child reaper started");
        Ok(Self {
            registry,
            background: Some(Background {
                signals: handle,
                thread,
            }),
        })
    }

    /// Handle to the registry, usable after the reaper has moved elsewhere.
    pub fn registry(&self) -> ChildRegistry {
        self.registry.clone()
    }

    pub fn fork(&self, kind: ChildKind, slot: Option<Slot>) -> io::Result<Forked> {
        self.registry.fork(kind, slot)
    }

    pub fn reap(&self) -> usize {
        self.registry.reap()
    }

    pub fn outstanding(&self) -> usize {
        self.registry.outstanding()
    }

    /// Stop the collector thread and drain whatever has already exited.
    ///
    /// Children still running stay registered.
    pub fn stop(&mut self) {
        if let Some(background) = self.background.take() {
            background.signals.close();
            if background.thread.join().is_err() {
                warn!("Reaper thread panicked");
            }
            self.registry.reap();
            debug!(outstanding = self.registry.outstanding(), "Child reaper stopped");
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerGroup;

    #[test]
    fn test_reaper_collects_children_and_releases_slots() {
        let mut reaper = Reaper::start().unwrap();
        let group = WorkerGroup::new(8);

        let mut pids = Vec::new();
        for _ in 0..3 {
            match reaper.fork(ChildKind::Session, Some(group.acquire())).unwrap() {
                Forked::Child => unsafe { libc::_exit(0) },
                Forked::Parent(pid) => pids.push(pid),
            }
        }

        assert_eq!(group.handles().len(), 3);
        assert!(reaper
            .registry()
            .wait_collected(&pids, Duration::from_secs(10)));
        assert_eq!(reaper.outstanding(), 0);
        assert!(group.wait_idle(Duration::from_secs(1)));

        reaper.stop();
        assert_eq!(reaper.reap(), 0);
    }
}
