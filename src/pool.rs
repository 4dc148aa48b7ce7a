//! Hybrid strategy: a fixed pool of long-lived processes.
//!
//! Each pool process inherits the listening socket and runs its own accept
//! loop, launching a detached thread per connection. All pool processes
//! contend on the same socket; the kernel decides which one wins each
//! connection.

use std::net::TcpListener;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::dispatcher::accept_loop;
use crate::reaper::{ChildKind, ChildRegistry, Forked, Pid, Reaper};
use crate::session::SessionOptions;
use crate::worker::{run_child, ThreadWorker, WorkerGroup};

/// Supervisor-side handle to the running pool processes.
pub struct WorkerPool {
    pids: Vec<Pid>,
    registry: ChildRegistry,
}

impl WorkerPool {
    /// Fork one pool process per entry in `shares`, each admitting at most
    /// that many concurrent sessions (0 = unbounded).
    ///
    /// A failed fork is logged and skipped; the call only fails if no
    /// process could be started at all.
    pub(crate) fn spawn(
        shares: &[usize],
        listener: &TcpListener,
        reaper: &Reaper,
        options: SessionOptions,
    ) -> std::io::Result<Self> {
        let supervisor = std::process::id();
        let mut pids = Vec::with_capacity(shares.len());
        let mut last_error = None;

        for (index, &capacity) in shares.iter().enumerate() {
            match reaper.fork(ChildKind::Pool, None) {
                Ok(Forked::Child) => run_child(|| {
                    pool_process(index, supervisor, listener, capacity, options)
                }),
                Ok(Forked::Parent(pid)) => pids.push(pid),
                Err(e) => {
                    error!(index, error = %e, "fork failed");
                    last_error = Some(e);
                }
            }
        }

        if pids.is_empty() {
            return Err(last_error.unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty worker pool")
            }));
        }

        info!(workers = pids.len(), "Worker pool started");
        Ok(Self {
            pids,
            registry: reaper.registry(),
        })
    }

    pub fn pids(&self) -> &[Pid] {
        &self.pids
    }

    /// Pool processes not yet collected by the reaper.
    pub fn running(&self) -> usize {
        self.pids
            .iter()
            .filter(|pid| self.registry.contains(**pid))
            .count()
    }

    /// Send `SIGTERM` to every pool process and wait for the reaper to
    /// collect them. Returns `true` if all exited within `timeout`.
    pub fn shutdown(self, timeout: Duration) -> bool {
        for &pid in &self.pids {
            if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
                warn!(pid, error = %std::io::Error::last_os_error(), "kill failed");
            }
        }
        let collected = self.registry.wait_collected(&self.pids, timeout);
        info!(collected, "Worker pool shut down");
        collected
    }
}

/// Body of one pool process: accept forever, one thread per connection.
fn pool_process(
    index: usize,
    supervisor: u32,
    listener: &TcpListener,
    capacity: usize,
    options: SessionOptions,
) {
    exit_with_supervisor(supervisor);

    let pid = std::process::id();
    info!(index, pid, capacity, "Worker process started");

    let workers = WorkerGroup::new(capacity);
    accept_loop(listener, &workers, &ThreadWorker::new(options))
}

/// Ask the kernel to terminate this process when the supervisor goes away.
#[cfg(target_os = "linux")]
fn exit_with_supervisor(supervisor: u32) {
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM as libc::c_ulong);
    }
    // The supervisor may have exited before prctl took effect
    let parent = unsafe { libc::getppid() };
    if parent as u32 != supervisor {
        std::process::exit(0);
    }
}

#[cfg(not(target_os = "linux"))]
fn exit_with_supervisor(_supervisor: u32) {}

/// Split the server-wide client bound across the pool.
///
/// The shares sum to exactly `max_clients`. A pool larger than the bound is
/// shrunk to `max_clients` processes of one slot each, since a process
/// with no slot could never serve anyone. `max_clients == 0` keeps every
/// process unbounded.
pub fn pool_shares(max_clients: usize, pool_size: usize) -> Vec<usize> {
    if max_clients == 0 {
        return vec![0; pool_size];
    }
    let processes = pool_size.min(max_clients);
    if processes == 0 {
        return Vec::new();
    }
    let base = max_clients / processes;
    let extra = max_clients % processes;
    (0..processes)
        .map(|i| if i < extra { base + 1 } else { base })
        .collect()
}
