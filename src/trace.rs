//! Raw packet dumps for debugging.
//!
//! Each chunk is rendered as two log lines: the bytes in hex and the same
//! bytes as (lossy) ASCII text. Callers only dump when packet tracing is
//! enabled, so the lines are logged at info level.

use std::fmt::Write;
use tracing::info;

/// Direction of a traced chunk relative to the local side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Recv,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Send => "SEND",
            Direction::Recv => "RECV",
        }
    }
}

/// Render bytes as space-separated lowercase hex pairs.
pub fn hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Log one chunk.
pub fn packet(direction: Direction, data: &[u8]) {
    info!(direction = direction.as_str(), len = data.len(), "[PACKET] {}", hex(data));
    info!(
        direction = direction.as_str(),
        "[PACKET] (ASCII): {}",
        String::from_utf8_lossy(data)
    );
}
