//! Configuration for the `pgwire-double` binary.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::options::{
    self, ServerOption, DEFAULT_HOST, DEFAULT_MAX_CONNECTIONS, DEFAULT_SERVER_VERSION,
    DEFAULT_TIME_ZONE,
};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Default listen port
pub const DEFAULT_PORT: u16 = 54322;

/// Command-line arguments for the test server
#[derive(Parser, Debug)]
#[command(name = "pgwire-double")]
#[command(version)]
#[command(about = "A PostgreSQL wire protocol test double", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Value reported as the server_version parameter
    #[arg(long)]
    pub server_version: Option<String>,

    /// Value reported as the TimeZone parameter
    #[arg(long)]
    pub time_zone: Option<String>,

    /// Completion tag returned for every query (default: OK)
    #[arg(short, long)]
    pub reply: Option<String>,

    /// Per-operation read/write timeout in seconds (0 = no timeout)
    #[arg(long)]
    pub io_timeout_secs: Option<u64>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Listener and reported parameters
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_server_version")]
    pub server_version: String,
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            server_version: default_server_version(),
            time_zone: default_time_zone(),
            max_connections: default_max_connections(),
        }
    }
}

/// Per-session behaviour
#[derive(Debug, Deserialize)]
pub struct SessionSection {
    /// Completion tag returned for every query
    pub reply: Option<String>,
    /// Read/write timeout in seconds (0 = no timeout)
    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            reply: None,
            io_timeout_secs: default_io_timeout_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_server_version() -> String {
    DEFAULT_SERVER_VERSION.to_string()
}

fn default_time_zone() -> String {
    DEFAULT_TIME_ZONE.to_string()
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_io_timeout_secs() -> u64 {
    options::DEFAULT_IO_TIMEOUT.as_secs()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub server_version: String,
    pub time_zone: String,
    pub reply: Option<String>,
    pub io_timeout_secs: u64,
    pub max_connections: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            server_version: cli
                .server_version
                .unwrap_or(toml_config.server.server_version),
            time_zone: cli.time_zone.unwrap_or(toml_config.server.time_zone),
            reply: cli.reply.or(toml_config.session.reply),
            io_timeout_secs: cli
                .io_timeout_secs
                .unwrap_or(toml_config.session.io_timeout_secs),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Server options equivalent to this configuration, in application order.
    pub fn server_options(&self) -> Vec<ServerOption> {
        let io_timeout = match self.io_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        vec![
            options::with_host(self.host.clone()),
            options::with_server_version(self.server_version.clone()),
            options::with_time_zone(self.time_zone.clone()),
            options::with_io_timeout(io_timeout),
            options::with_max_connections(self.max_connections),
        ]
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
