//! Helpers shared by the strategy integration tests.

#![allow(dead_code)]

use echo_dispatch::config::StrategyKind;
use echo_dispatch::reaper::ChildRegistry;
use echo_dispatch::{Config, Dispatcher, WorkerGroup};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn loopback_config(strategy: StrategyKind, max_clients: usize) -> Config {
    Config {
        listen: "127.0.0.1:0".to_string(),
        strategy,
        max_clients,
        pool_size: 2,
        ..Config::default()
    }
}

/// A dispatcher running its accept loop on a background thread.
pub struct RunningServer {
    pub addr: SocketAddr,
    pub workers: WorkerGroup,
    pub registry: Option<ChildRegistry>,
}

pub fn start_server(config: &Config) -> RunningServer {
    let dispatcher = Dispatcher::bind(config).expect("bind");
    let server = RunningServer {
        addr: dispatcher.local_addr(),
        workers: dispatcher.workers(),
        registry: dispatcher.reaper().map(|r| r.registry()),
    };
    thread::spawn(move || dispatcher.run());
    server
}

pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("connect");
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    stream
}

/// Send `payload` in one write and read back exactly as many bytes.
pub fn exchange(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
    stream.write_all(payload).expect("write");
    let mut echoed = vec![0u8; payload.len()];
    stream.read_exact(&mut echoed).expect("read echo");
    echoed
}

/// Close the connection for every holder of the socket, including forked
/// children that inherited a copy of the descriptor.
pub fn hang_up(stream: TcpStream) {
    let _ = stream.shutdown(Shutdown::Both);
}

/// Connect, echo `payload` once, hang up.
pub fn echo_once(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut stream = connect(addr);
    let echoed = exchange(&mut stream, payload);
    hang_up(stream);
    echoed
}

/// Distinct payloads from concurrent clients never cross sessions.
pub fn assert_no_cross_talk(addr: SocketAddr, clients: usize, rounds: usize) {
    let handles: Vec<_> = (0..clients)
        .map(|id| {
            thread::spawn(move || {
                let mut stream = connect(addr);
                for round in 0..rounds {
                    let payload = format!("client-{id}-round-{round}").into_bytes();
                    assert_eq!(exchange(&mut stream, &payload), payload);
                }
                hang_up(stream);
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("client thread");
    }
}

/// Two clients send `AAA` and `BBB` at the same moment.
pub fn assert_simultaneous_pair(addr: SocketAddr) {
    let barrier = std::sync::Arc::new(std::sync::Barrier::new(2));
    let handles: Vec<_> = [b"AAA", b"BBB"]
        .into_iter()
        .map(|payload| {
            let barrier = barrier.clone();
            thread::spawn(move || {
                let mut stream = connect(addr);
                barrier.wait();
                let echoed = exchange(&mut stream, payload);
                hang_up(stream);
                echoed == payload
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.join().expect("client thread"));
    }
}

/// Binary payload cycling through every byte value.
pub fn binary_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

/// Terminated-but-uncollected children of this process.
#[cfg(target_os = "linux")]
pub fn zombie_children() -> usize {
    let me = std::process::id().to_string();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return 0;
    };

    entries
        .filter_map(Result::ok)
        .filter_map(|entry| std::fs::read_to_string(entry.path().join("stat")).ok())
        .filter(|stat| {
            // Fields after the parenthesised command name: state, ppid, ...
            let Some(close) = stat.rfind(')') else {
                return false;
            };
            let mut fields = stat[close + 1..].split_whitespace();
            let state = fields.next();
            let ppid = fields.next();
            state == Some("Z") && ppid == Some(me.as_str())
        })
        .count()
}

/// Open descriptors of this process.
#[cfg(target_os = "linux")]
pub fn open_descriptors() -> usize {
    std::fs::read_dir("/proc/self/fd")
        .map(|entries| entries.count())
        .unwrap_or(0)
}

/// Poll `check` until it holds or `timeout` elapses.
pub fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(20));
    }
}
