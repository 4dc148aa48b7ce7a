//! Setup-time failures.
//!
//! Only these are fatal to the server. Everything that happens to a single
//! connection after setup is contained in its worker and reported as a
//! `SessionOutcome` or a log line.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

use crate::config::ConfigError;
use crate::dispatcher::Strategy;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("socket creation failed: {0}")]
    Socket(#[source] io::Error),

    #[error("bind to {addr} failed: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("listen on {addr} failed: {source}")]
    Listen { addr: SocketAddr, source: io::Error },

    #[error("failed to start child reaper: {0}")]
    Reaper(#[source] io::Error),

    #[error("no pool worker process could be started: {0}")]
    Pool(#[source] io::Error),

    #[error("strategy {0:?} does not use a process pool")]
    NotPooled(Strategy),
}
