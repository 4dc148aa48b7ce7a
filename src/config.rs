//! Configuration module for the echo server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values. Every setting has
//! a default, so the server runs with no arguments at all.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::dispatcher::Strategy;

/// Bytes read from a connection per call.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Listen backlog handed to `listen(2)`.
pub const DEFAULT_BACKLOG: i32 = 5;

/// Concurrently active workers allowed (0 = unbounded).
pub const DEFAULT_MAX_CLIENTS: usize = 10;

/// Long-lived processes forked by the hybrid strategy.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// How accepted connections are handed to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Serve one connection at a time on the accepting thread
    Iterative,
    /// Fork one child process per connection
    PerProcess,
    /// Spawn one detached thread per connection
    PerThread,
    /// Fixed pool of processes, each spawning a thread per connection
    Hybrid,
}

/// Command-line arguments for the echo server
#[derive(Parser, Debug, Default)]
#[command(name = "echo-server")]
#[command(version = "0.1.0")]
#[command(about = "A TCP echo server with pluggable dispatch strategies", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:8081)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Dispatch strategy
    #[arg(short = 's', long, value_enum)]
    pub strategy: Option<StrategyKind>,

    /// Number of worker processes for the hybrid strategy
    #[arg(short = 'p', long)]
    pub pool_size: Option<usize>,

    /// Maximum concurrently active workers (0 = unbounded)
    #[arg(short = 'm', long)]
    pub max_clients: Option<usize>,

    /// Read buffer size in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Dump every received and sent chunk as hex and ASCII
    #[arg(long)]
    pub packet_trace: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and dispatch configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_strategy")]
    pub strategy: StrategyKind,
    /// Processes in the hybrid pool
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Concurrently active workers (0 = unbounded)
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            strategy: default_strategy(),
            pool_size: default_pool_size(),
            max_clients: default_max_clients(),
        }
    }
}

/// Per-connection session configuration
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default)]
    pub packet_trace: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            packet_trace: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8081".to_string()
}

fn default_backlog() -> i32 {
    DEFAULT_BACKLOG
}

fn default_strategy() -> StrategyKind {
    StrategyKind::PerThread
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_max_clients() -> usize {
    DEFAULT_MAX_CLIENTS
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub backlog: i32,
    pub strategy: StrategyKind,
    pub pool_size: usize,
    pub max_clients: usize,
    pub buffer_size: usize,
    pub packet_trace: bool,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = match cli.config {
            Some(ref config_path) => read_toml(config_path)?,
            None => TomlConfig::default(),
        };

        let config = Config::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args over TOML values.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            strategy: cli.strategy.unwrap_or(toml_config.server.strategy),
            pool_size: cli.pool_size.unwrap_or(toml_config.server.pool_size),
            max_clients: cli.max_clients.unwrap_or(toml_config.server.max_clients),
            buffer_size: cli.buffer_size.unwrap_or(toml_config.session.buffer_size),
            packet_trace: cli.packet_trace || toml_config.session.packet_trace,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    /// Reject values no strategy can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be at least 1"));
        }
        if self.pool_size == 0 {
            return Err(ConfigError::Invalid("pool_size must be at least 1"));
        }
        self.listen_addr()?;
        Ok(())
    }

    /// The dispatch strategy as a tagged value.
    pub fn strategy(&self) -> Strategy {
        match self.strategy {
            StrategyKind::Iterative => Strategy::Iterative,
            StrategyKind::PerProcess => Strategy::PerProcess,
            StrategyKind::PerThread => Strategy::PerThread,
            StrategyKind::Hybrid => Strategy::HybridPool(self.pool_size),
        }
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.listen.clone()))
    }
}

fn read_toml(path: &Path) -> Result<TomlConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
        path: path.to_path_buf(),
        source,
    })
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid listen address '{0}'")]
    InvalidAddress(String),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
