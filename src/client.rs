//! Interactive line-oriented echo client.
//!
//! Reads lines from an input, sends each one to the server and prints the
//! response. The literal line `quit` ends the session locally and is never
//! transmitted.

use std::io::{self, BufRead, Read, Write};
use tracing::{error, info};

use crate::config::DEFAULT_BUFFER_SIZE;
use crate::trace::{packet, Direction};

pub const PROMPT: &str = "Enter message (or 'quit' to exit): ";

/// Line that ends the session without being sent.
pub const QUIT: &str = "quit";

#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub buffer_size: usize,
    pub packet_trace: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            packet_trace: false,
        }
    }
}

/// How the interactive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientExit {
    /// User typed `quit`.
    Quit,
    /// Input reached end of file.
    EndOfInput,
    /// Server closed the connection.
    ServerClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSummary {
    pub exchanges: usize,
    pub exit: ClientExit,
}

/// Drive one interactive session over `stream`.
///
/// Send and receive failures are returned as errors; a zero-byte response
/// ends the session with [`ClientExit::ServerClosed`].
pub fn run_session<S, I, O>(
    mut stream: S,
    mut input: I,
    mut output: O,
    options: ClientOptions,
) -> io::Result<ClientSummary>
where
    S: Read + Write,
    I: BufRead,
    O: Write,
{
    let mut line = String::new();
    let mut buffer = vec![0u8; options.buffer_size];
    let mut exchanges = 0;

    loop {
        write!(output, "{PROMPT}")?;
        output.flush()?;

        line.clear();
        if input.read_line(&mut line)? == 0 {
            return Ok(ClientSummary {
                exchanges,
                exit: ClientExit::EndOfInput,
            });
        }
        let message = line.trim_end_matches(['\r', '\n']);

        if message == QUIT {
            return Ok(ClientSummary {
                exchanges,
                exit: ClientExit::Quit,
            });
        }
        // Nothing would come back for an empty send
        if message.is_empty() {
            continue;
        }

        if options.packet_trace {
            packet(Direction::Send, message.as_bytes());
        }
        stream.write_all(message.as_bytes()).map_err(|e| {
            error!(error = %e, "send failed");
            e
        })?;

        let n = stream.read(&mut buffer).map_err(|e| {
            error!(error = %e, "recv failed");
            e
        })?;
        if n == 0 {
            error!("recv failed: server closed the connection");
            return Ok(ClientSummary {
                exchanges,
                exit: ClientExit::ServerClosed,
            });
        }

        let response = &buffer[..n];
        if options.packet_trace {
            packet(Direction::Recv, response);
        }
        writeln!(output, "Server response: {}", String::from_utf8_lossy(response))?;
        exchanges += 1;
    }
}

/// Connect to `addr` and run the interactive loop on stdin/stdout.
pub fn run(addr: std::net::SocketAddr, options: ClientOptions) -> io::Result<ClientSummary> {
    let stream = std::net::TcpStream::connect(addr)?;
    info!(server = %addr, "Connected to server");

    let stdin = io::stdin();
    let stdout = io::stdout();
    run_session(stream, stdin.lock(), stdout.lock(), options)
}
