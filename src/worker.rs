//! Units of concurrent execution that own one connection each.
//!
//! A `WorkerGroup` tracks every unit that is currently servicing a
//! connection and bounds how many may run at once. Each unit holds a `Slot`
//! for its whole lifetime; dropping the slot deregisters the unit and lets
//! the dispatcher accept the next connection.

use slab::Slab;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::reaper::{ChildKind, Forked, Pid, Reaper};
use crate::session::{self, Connection, SessionOptions};

/// Opaque reference to the unit servicing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerHandle {
    /// Detached thread in the current process.
    Thread(ThreadId),
    /// Child process forked for one connection.
    Process(Pid),
}

/// Starts a unit of concurrency for an accepted connection.
///
/// `launch` returns as soon as the unit is running. On error the connection
/// has already been dropped (and therefore closed).
pub trait WorkerUnit {
    fn launch(&self, conn: Connection, slot: Slot) -> std::io::Result<WorkerHandle>;
}

struct GroupInner {
    units: Mutex<Slab<Option<WorkerHandle>>>,
    changed: Condvar,
    /// Maximum concurrently registered units (0 = unbounded).
    capacity: usize,
}

impl GroupInner {
    fn lock(&self) -> MutexGuard<'_, Slab<Option<WorkerHandle>>> {
        self.units.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registry of active workers with an optional concurrency bound.
#[derive(Clone)]
pub struct WorkerGroup {
    inner: Arc<GroupInner>,
}

impl WorkerGroup {
    /// Create a group admitting at most `capacity` units (0 = unbounded).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                units: Mutex::new(Slab::with_capacity(capacity)),
                changed: Condvar::new(),
                capacity,
            }),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(0)
    }

    /// Reserve a slot, blocking while the group is full.
    pub fn acquire(&self) -> Slot {
        let inner = &self.inner;
        let mut units = inner.lock();
        if inner.capacity > 0 && units.len() >= inner.capacity {
            debug!(capacity = inner.capacity, "Worker limit reached, waiting for a slot");
            units = inner
                .changed
                .wait_while(units, |u| u.len() >= inner.capacity)
                .unwrap_or_else(PoisonError::into_inner);
        }
        let key = units.insert(None);
        Slot {
            group: Arc::clone(inner),
            key,
        }
    }

    /// Reserve a slot if one is free right now.
    pub fn try_acquire(&self) -> Option<Slot> {
        let inner = &self.inner;
        let mut units = inner.lock();
        if inner.capacity > 0 && units.len() >= inner.capacity {
            return None;
        }
        let key = units.insert(None);
        Some(Slot {
            group: Arc::clone(inner),
            key,
        })
    }

    /// Number of slots currently held.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum concurrently held slots (0 = unbounded).
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Handles of every unit that has bound its slot.
    pub fn handles(&self) -> Vec<WorkerHandle> {
        self.inner.lock().iter().filter_map(|(_, h)| *h).collect()
    }

    /// Block until every slot is released or `timeout` elapses.
    ///
    /// Returns `true` if the group drained.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let inner = &self.inner;
        let units = inner.lock();
        let (units, _) = inner
            .changed
            .wait_timeout_while(units, timeout, |u| !u.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        units.is_empty()
    }
}

/// Reservation in a `WorkerGroup`, released on drop.
pub struct Slot {
    group: Arc<GroupInner>,
    key: usize,
}

impl Slot {
    /// Record which unit holds this slot.
    pub fn bind(&self, handle: WorkerHandle) {
        if let Some(entry) = self.group.lock().get_mut(self.key) {
            *entry = Some(handle);
        }
    }

    pub fn key(&self) -> usize {
        self.key
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot").field("key", &self.key).finish()
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        let mut units = self.group.lock();
        units.try_remove(self.key);
        drop(units);
        self.group.changed.notify_all();
    }
}

/// Runs the session on the accepting thread; `launch` returns only once the
/// peer is gone, so connections are served strictly one after another.
#[derive(Debug, Clone, Copy)]
pub struct InlineWorker {
    options: SessionOptions,
}

impl InlineWorker {
    pub fn new(options: SessionOptions) -> Self {
        Self { options }
    }
}

impl WorkerUnit for InlineWorker {
    fn launch(&self, conn: Connection, slot: Slot) -> std::io::Result<WorkerHandle> {
        let handle = WorkerHandle::Thread(thread::current().id());
        slot.bind(handle);
        session::run(conn, self.options);
        drop(slot);
        Ok(handle)
    }
}

/// One detached thread per connection.
#[derive(Debug, Clone, Copy)]
pub struct ThreadWorker {
    options: SessionOptions,
}

impl ThreadWorker {
    pub fn new(options: SessionOptions) -> Self {
        Self { options }
    }
}

impl WorkerUnit for ThreadWorker {
    fn launch(&self, conn: Connection, slot: Slot) -> std::io::Result<WorkerHandle> {
        let options = self.options;
        let handle = thread::Builder::new()
            .name(format!("conn-{}", slot.key()))
            .spawn(move || {
                slot.bind(WorkerHandle::Thread(thread::current().id()));
                debug!(
                    pid = std::process::id(),
                    peer = %conn.peer,
                    "Thread started for client"
                );
                session::run(conn, options);
                drop(slot);
            })?;

        // Dropping the JoinHandle detaches the thread
        Ok(WorkerHandle::Thread(handle.thread().id()))
    }
}

/// One forked child process per connection.
pub struct ProcessWorker<'a> {
    reaper: &'a Reaper,
    listener_fd: RawFd,
    options: SessionOptions,
}

impl<'a> ProcessWorker<'a> {
    pub fn new(reaper: &'a Reaper, listener_fd: RawFd, options: SessionOptions) -> Self {
        Self {
            reaper,
            listener_fd,
            options,
        }
    }
}

impl WorkerUnit for ProcessWorker<'_> {
    fn launch(&self, conn: Connection, slot: Slot) -> std::io::Result<WorkerHandle> {
        // The slot stays parked in the reaper until the child is collected
        match self.reaper.fork(ChildKind::Session, Some(slot))? {
            Forked::Child => {
                let listener_fd = self.listener_fd;
                let options = self.options;
                run_child(move || {
                    // The listener is never dropped in the child, so its
                    // inherited descriptor is closed directly.
                    unsafe { libc::close(listener_fd) };
                    let pid = std::process::id();
                    info!(pid, peer = %conn.peer, "Child process handling client");
                    session::run(conn, options);
                    info!(pid, "Child process exiting");
                })
            }
            Forked::Parent(pid) => {
                // The child holds its own copy of the socket
                drop(conn);
                Ok(WorkerHandle::Process(pid))
            }
        }
    }
}

/// Run the body of a forked child and exit. Never unwinds back into the
/// parent's stack frames.
pub(crate) fn run_child<F: FnOnce()>(body: F) -> ! {
    let code = match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(()) => 0,
        Err(_) => {
            error!(pid = std::process::id(), "Child process panicked");
            1
        }
    };
    std::process::exit(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};

    #[test]
    fn test_slot_registration() {
        let group = WorkerGroup::new(2);
        assert!(group.is_empty());

        let s1 = group.acquire();
        let s2 = group.acquire();
        assert_eq!(group.len(), 2);

        // At capacity
        assert!(group.try_acquire().is_none());

        s1.bind(WorkerHandle::Process(42));
        assert_eq!(group.handles(), vec![WorkerHandle::Process(42)]);

        drop(s1);
        assert_eq!(group.len(), 1);
        assert!(group.try_acquire().is_some());

        drop(s2);
        assert!(group.is_empty());
    }

    #[test]
    fn test_unbounded_group() {
        let group = WorkerGroup::unbounded();
        let slots: Vec<_> = (0..64).map(|_| group.acquire()).collect();
        assert_eq!(group.len(), 64);
        assert_eq!(group.capacity(), 0);
        drop(slots);
        assert!(group.is_empty());
    }

    #[test]
    fn test_acquire_blocks_until_release() {
        let group = WorkerGroup::new(1);
        let held = group.acquire();

        let waiter = {
            let group = group.clone();
            thread::spawn(move || {
                let slot = group.acquire();
                slot.key()
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        drop(held);
        waiter.join().unwrap();
        assert!(group.is_empty());
    }

    #[test]
    fn test_wait_idle() {
        let group = WorkerGroup::new(4);
        assert!(group.wait_idle(Duration::from_millis(1)));

        let slot = group.acquire();
        assert!(!group.wait_idle(Duration::from_millis(20)));

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(slot);
        });
        assert!(group.wait_idle(Duration::from_secs(5)));
        releaser.join().unwrap();
    }

    #[test]
    fn test_thread_worker_echoes_and_releases_slot() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let group = WorkerGroup::new(1);
        let worker = ThreadWorker::new(SessionOptions::default());

        let mut client = TcpStream::connect(addr).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        let slot = group.acquire();
        let handle = worker
            .launch(Connection::new(stream, peer), slot)
            .unwrap();
        assert!(matches!(handle, WorkerHandle::Thread(_)));

        client.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        drop(client);
        assert!(group.wait_idle(Duration::from_secs(5)));
    }

    #[test]
    fn test_inline_worker_returns_after_session() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let group = WorkerGroup::new(1);

        let client = thread::spawn(move || {
            let mut client = TcpStream::connect(addr).unwrap();
            client.write_all(b"inline").unwrap();
            let mut buf = [0u8; 6];
            client.read_exact(&mut buf).unwrap();
            buf
        });

        let (stream, peer) = listener.accept().unwrap();
        let worker = InlineWorker::new(SessionOptions::default());
        let handle = worker
            .launch(Connection::new(stream, peer), group.acquire())
            .unwrap();

        // The client has hung up by the time launch returns
        assert_eq!(handle, WorkerHandle::Thread(thread::current().id()));
        assert!(group.is_empty());
        assert_eq!(&client.join().unwrap(), b"inline");
    }
}
