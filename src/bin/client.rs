//! echo-client: interactive client for the echo server.
//!
//! Usage: `echo-client <server_ip>`. Type lines to have them echoed back;
//! `quit` exits without sending anything.

use clap::Parser;
use echo_dispatch::client::{self, ClientOptions};
use echo_dispatch::config::DEFAULT_BUFFER_SIZE;
use std::net::{Ipv4Addr, SocketAddr};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "echo-client")]
#[command(version = "0.1.0")]
#[command(about = "Interactive client for echo-server", long_about = None)]
struct Args {
    /// IPv4 address of the server
    server_ip: Ipv4Addr,

    /// Server port
    #[arg(short, long, default_value_t = 8081)]
    port: u16,

    /// Dump every sent and received chunk as hex and ASCII
    #[arg(long)]
    packet_trace: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let addr = SocketAddr::from((args.server_ip, args.port));
    let options = ClientOptions {
        buffer_size: DEFAULT_BUFFER_SIZE,
        packet_trace: args.packet_trace,
    };

    let summary = client::run(addr, options)?;
    info!(exchanges = summary.exchanges, exit = ?summary.exit, "Disconnected");
    Ok(())
}
