//! Per-connection echo loop.
//!
//! Every strategy ends up here: read up to `buffer_size` bytes, write the
//! same bytes back in one call, repeat until the peer closes or I/O fails.
//! There is no framing, no size limit beyond the buffer and no idle timeout.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use tracing::{debug, trace, warn};

use crate::config::{Config, DEFAULT_BUFFER_SIZE};
use crate::trace::{packet, Direction};

/// An accepted client connection.
///
/// Owned by exactly one worker; dropping it closes the socket.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self { stream, peer }
    }
}

/// Settings shared by every session of one server.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Maximum bytes taken per read.
    pub buffer_size: usize,
    /// Dump received and sent chunks.
    pub packet_trace: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            packet_trace: false,
        }
    }
}

impl From<&Config> for SessionOptions {
    fn from(config: &Config) -> Self {
        Self {
            buffer_size: config.buffer_size,
            packet_trace: config.packet_trace,
        }
    }
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// Peer performed an orderly close.
    Closed { echoed: u64 },
    /// A read returned an error.
    ReadFailure { echoed: u64, error: io::Error },
    /// A write errored or wrote fewer bytes than were read.
    WriteFailure { echoed: u64, error: io::Error },
}

impl SessionOutcome {
    /// Total bytes echoed before the session ended.
    pub fn echoed(&self) -> u64 {
        match self {
            SessionOutcome::Closed { echoed }
            | SessionOutcome::ReadFailure { echoed, .. }
            | SessionOutcome::WriteFailure { echoed, .. } => *echoed,
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, SessionOutcome::Closed { .. })
    }
}

/// Run the echo loop on a connection until it ends.
///
/// The connection is consumed and closed on every exit path.
pub fn run(conn: Connection, options: SessionOptions) -> SessionOutcome {
    let Connection { stream, peer } = conn;
    let outcome = echo(stream, options);
    match &outcome {
        SessionOutcome::Closed { echoed } => {
            debug!(peer = %peer, echoed, "Client connection closed");
        }
        SessionOutcome::ReadFailure { echoed, error } => {
            warn!(peer = %peer, echoed, error = %error, "recv failed");
        }
        SessionOutcome::WriteFailure { echoed, error } => {
            warn!(peer = %peer, echoed, error = %error, "send failed");
        }
    }
    outcome
}

/// Echo loop over any byte stream. Takes ownership so the stream is dropped
/// before the outcome is returned.
pub fn echo<S: Read + Write>(mut stream: S, options: SessionOptions) -> SessionOutcome {
    let mut buffer = vec![0u8; options.buffer_size];
    let mut echoed = 0u64;

    loop {
        let n = match stream.read(&mut buffer) {
            Ok(0) => return SessionOutcome::Closed { echoed },
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return SessionOutcome::ReadFailure { echoed, error },
        };

        let chunk = &buffer[..n];
        trace!(len = n, "Received");
        if options.packet_trace {
            packet(Direction::Recv, chunk);
        }

        match stream.write(chunk) {
            Ok(written) if written == n => {}
            Ok(written) => {
                let error = io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short write: {written} of {n} bytes"),
                );
                return SessionOutcome::WriteFailure { echoed, error };
            }
            Err(error) => return SessionOutcome::WriteFailure { echoed, error },
        }

        if options.packet_trace {
            packet(Direction::Send, chunk);
        }
        echoed += n as u64;
    }
}
