//! Listening socket ownership and connection dispatch.
//!
//! One `Dispatcher` serves every strategy. It binds the socket, then either
//! runs the accept loop itself (iterative, per-process, per-thread) or forks
//! the hybrid pool and leaves accepting to the pool processes.
//!
//! The accept loop acquires a worker slot *before* calling accept, so when
//! `max_clients` units are active further clients wait in the listen backlog.

use socket2::{Domain, Protocol, Socket, Type};
use std::convert::Infallible;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::SetupError;
use crate::pool::{pool_shares, WorkerPool};
use crate::reaper::Reaper;
use crate::session::{Connection, SessionOptions};
use crate::worker::{InlineWorker, ProcessWorker, ThreadWorker, WorkerGroup, WorkerUnit};

/// How each accepted connection is serviced. Fixed for the server's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Serve each connection on the accepting thread, one at a time.
    Iterative,
    /// Fork one child per connection.
    PerProcess,
    /// Spawn one detached thread per connection.
    PerThread,
    /// Fork `n` accepting processes up front, each spawning a thread per connection.
    HybridPool(usize),
}

impl Strategy {
    /// Whether this strategy forks and therefore needs a reaper.
    pub fn uses_processes(self) -> bool {
        matches!(self, Strategy::PerProcess | Strategy::HybridPool(_))
    }
}

/// Source of accepted connections.
pub trait Acceptor {
    fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

impl Acceptor for TcpListener {
    fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self)
    }
}

/// Accept forever, handing each connection to `worker`.
///
/// Accept failures are logged and the loop continues. A failed launch drops
/// the connection and the loop continues.
pub fn accept_loop<A, W>(acceptor: &A, workers: &WorkerGroup, worker: &W) -> !
where
    A: Acceptor + ?Sized,
    W: WorkerUnit + ?Sized,
{
    loop {
        let slot = workers.acquire();

        let conn = match acceptor.accept() {
            Ok((stream, peer)) => Connection::new(stream, peer),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(pid = std::process::id(), error = %e, "accept failed");
                continue;
            }
        };

        let peer = conn.peer;
        info!(pid = std::process::id(), peer = %peer, "New connection");

        match worker.launch(conn, slot) {
            Ok(handle) => debug!(peer = %peer, ?handle, "Worker launched"),
            Err(e) => error!(peer = %peer, error = %e, "Failed to launch worker, connection dropped"),
        }
    }
}

/// Create the listening socket: stream, bound on `addr`, listening with `backlog`.
pub fn create_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener, SetupError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(SetupError::Socket)?;

    socket.set_reuse_address(true).map_err(SetupError::Socket)?;
    socket
        .bind(&addr.into())
        .map_err(|source| SetupError::Bind { addr, source })?;
    socket
        .listen(backlog)
        .map_err(|source| SetupError::Listen { addr, source })?;

    Ok(socket.into())
}

/// Owns the listening endpoint and the strategy's supporting components.
pub struct Dispatcher {
    listener: TcpListener,
    local_addr: SocketAddr,
    strategy: Strategy,
    options: SessionOptions,
    max_clients: usize,
    workers: WorkerGroup,
    reaper: Option<Reaper>,
}

impl Dispatcher {
    /// Bind the listening socket and start the reaper if the strategy forks.
    pub fn bind(config: &Config) -> Result<Self, SetupError> {
        let addr = config.listen_addr()?;
        let listener = create_listener(addr, config.backlog)?;
        let local_addr = listener.local_addr().map_err(SetupError::Socket)?;
        let strategy = config.strategy();

        let reaper = if strategy.uses_processes() {
            Some(Reaper::start().map_err(SetupError::Reaper)?)
        } else {
            None
        };

        info!(
            addr = %local_addr,
            strategy = ?strategy,
            backlog = config.backlog,
            max_clients = config.max_clients,
            "Server started"
        );

        Ok(Self {
            listener,
            local_addr,
            strategy,
            options: SessionOptions::from(config),
            max_clients: config.max_clients,
            workers: WorkerGroup::new(config.max_clients),
            reaper,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Workers launched by this process's accept loop.
    ///
    /// Under the hybrid strategy each pool process has its own group and this
    /// one stays empty.
    pub fn workers(&self) -> WorkerGroup {
        self.workers.clone()
    }

    pub fn reaper(&self) -> Option<&Reaper> {
        self.reaper.as_ref()
    }

    /// Fork the hybrid pool. The per-process shares of `max_clients` add up
    /// to exactly `max_clients`, so the pool may be smaller than requested.
    pub fn start_pool(&self) -> Result<WorkerPool, SetupError> {
        let (Strategy::HybridPool(size), Some(reaper)) = (self.strategy, self.reaper.as_ref())
        else {
            return Err(SetupError::NotPooled(self.strategy));
        };

        let shares = pool_shares(self.max_clients, size);
        if shares.len() < size {
            warn!(
                requested = size,
                processes = shares.len(),
                max_clients = self.max_clients,
                "Pool larger than max_clients, shrinking"
            );
        }
        WorkerPool::spawn(&shares, &self.listener, reaper, self.options)
            .map_err(SetupError::Pool)
    }

    /// Serve forever. Only setup failures return.
    pub fn run(self) -> Result<Infallible, SetupError> {
        match (self.strategy, self.reaper.as_ref()) {
            (Strategy::Iterative, _) => {
                accept_loop(&self.listener, &self.workers, &InlineWorker::new(self.options))
            }
            (Strategy::PerThread, _) => {
                let worker = ThreadWorker::new(self.options);
                accept_loop(&self.listener, &self.workers, &worker)
            }
            (Strategy::PerProcess, Some(reaper)) => {
                let worker = ProcessWorker::new(reaper, self.listener.as_raw_fd(), self.options);
                accept_loop(&self.listener, &self.workers, &worker)
            }
            (Strategy::HybridPool(_), Some(_)) => {
                let pool = self.start_pool()?;
                info!(pids = ?pool.pids(), "Supervisor idle, pool processes accepting");
                loop {
                    thread::sleep(Duration::from_secs(1));
                }
            }
            (strategy, None) => Err(SetupError::Reaper(io::Error::other(format!(
                "{strategy:?} requires a running reaper"
            )))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config() -> Config {
        Config {
            listen: "127.0.0.1:0".to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn test_strategy_uses_processes() {
        assert!(!Strategy::Iterative.uses_processes());
        assert!(Strategy::PerProcess.uses_processes());
        assert!(Strategy::HybridPool(4).uses_processes());
        assert!(!Strategy::PerThread.uses_processes());
    }

    #[test]
    fn test_bind_ephemeral_port() {
        let dispatcher = Dispatcher::bind(&loopback_config()).unwrap();
        assert_ne!(dispatcher.local_addr().port(), 0);
        assert_eq!(dispatcher.strategy(), Strategy::PerThread);
        assert!(dispatcher.reaper().is_none());
        assert_eq!(dispatcher.workers().capacity(), 10);
    }

    #[test]
    fn test_bind_conflict_is_setup_error() {
        let first = Dispatcher::bind(&loopback_config()).unwrap();

        let mut config = loopback_config();
        config.listen = first.local_addr().to_string();
        // SO_REUSEADDR does not allow two live listeners on one port
        assert!(matches!(
            Dispatcher::bind(&config),
            Err(SetupError::Bind { .. })
        ));
    }

    #[test]
    fn test_invalid_address_is_setup_error() {
        let mut config = loopback_config();
        config.listen = "nowhere".to_string();
        assert!(matches!(
            Dispatcher::bind(&config),
            Err(SetupError::Config(_))
        ));
    }

    #[test]
    fn test_start_pool_requires_hybrid() {
        let dispatcher = Dispatcher::bind(&loopback_config()).unwrap();
        assert!(matches!(
            dispatcher.start_pool(),
            Err(SetupError::NotPooled(Strategy::PerThread))
        ));
    }
}
