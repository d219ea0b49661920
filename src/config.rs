//! Configuration module for the heartwire server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Where the first frame of a new connection is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AcceptMode {
    /// On the accept task itself; a stalled peer delays later accepts.
    #[default]
    Inline,
    /// On a dedicated task per connection.
    Spawned,
}

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "heartwire")]
#[command(version)]
#[command(about = "Framed envelope listener with heartbeat liveness", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// IPv4 address to listen on
    #[arg(long)]
    pub host: Option<Ipv4Addr>,

    /// TCP port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Pending connection backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Where the first frame of each connection is read
    #[arg(long, value_enum)]
    pub accept_mode: Option<AcceptMode>,

    /// Give up on a connection's first frame after this many milliseconds
    #[arg(long)]
    pub read_timeout_ms: Option<u64>,

    /// Seconds between heartbeat pings
    #[arg(long)]
    pub heartbeat_interval: Option<u64>,

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
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: Ipv4Addr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default)]
    pub accept_mode: AcceptMode,
    /// First-frame read timeout in milliseconds (unset = wait forever)
    pub read_timeout_ms: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            accept_mode: AcceptMode::default(),
            read_timeout_ms: None,
        }
    }
}

/// Heartbeat configuration
#[derive(Debug, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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

fn default_host() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_port() -> u16 {
    1337
}

fn default_backlog() -> i32 {
    10
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_write_timeout() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: Ipv4Addr,
    pub port: u16,
    pub backlog: i32,
    pub accept_mode: AcceptMode,
    pub read_timeout: Option<Duration>,
    pub heartbeat_interval: Duration,
    pub write_timeout: Duration,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    /// Merge CLI args over TOML values (CLI takes precedence).
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let server = toml_config.server;
        let heartbeat = toml_config.heartbeat;

        Config {
            host: cli.host.unwrap_or(server.host),
            port: cli.port.unwrap_or(server.port),
            backlog: cli.backlog.unwrap_or(server.backlog),
            accept_mode: cli.accept_mode.unwrap_or(server.accept_mode),
            read_timeout: cli
                .read_timeout_ms
                .or(server.read_timeout_ms)
                .map(Duration::from_millis),
            // tokio intervals reject a zero period
            heartbeat_interval: Duration::from_secs(
                cli.heartbeat_interval
                    .unwrap_or(heartbeat.interval_secs)
                    .max(1),
            ),
            write_timeout: Duration::from_millis(heartbeat.write_timeout_ms),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    /// Address the listener binds to.
    pub fn listen_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.host, self.port)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
}
