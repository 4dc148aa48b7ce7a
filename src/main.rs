//! echo-server: TCP echo server with selectable dispatch strategy.
//!
//! Strategies:
//! - iterative: one connection at a time on the accepting thread
//! - per-process: one forked child per connection
//! - per-thread: one detached thread per connection
//! - hybrid: a fixed pool of processes, one thread per connection each
//!
//! Configuration via CLI arguments or TOML file; every setting has a default.

use echo_dispatch::{Config, Dispatcher};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        strategy = ?config.strategy,
        pool_size = config.pool_size,
        max_clients = config.max_clients,
        buffer_size = config.buffer_size,
        "Starting echo server"
    );

    let dispatcher = Dispatcher::bind(&config)?;
    match dispatcher.run()? {}
}
