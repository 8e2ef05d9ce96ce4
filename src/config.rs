//! Configuration module for chunk-listener.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::decoder::DecodePolicy;
use crate::error::ConfigError;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the listener
#[derive(Parser, Debug, Default)]
#[command(name = "chunk-listener")]
#[command(version = "0.1.0")]
#[command(about = "Accepts one TCP connection at a time and prints what it receives", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind to (default 0.0.0.0)
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Port to listen on (default 5001)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Listen backlog (default 128)
    #[arg(short, long)]
    pub backlog: Option<u32>,

    /// Maximum bytes read per chunk (default 1024)
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Close a connection after this many idle seconds
    #[arg(long)]
    pub read_timeout: Option<u64>,

    /// How to handle bytes that are not valid UTF-8
    #[arg(long, value_enum)]
    pub decode: Option<DecodePolicy>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub listener: ListenerSection,
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Socket-related configuration
#[derive(Debug, Deserialize)]
pub struct ListenerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

impl Default for ListenerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
        }
    }
}

/// Per-connection configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionSection {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Idle read timeout in seconds
    pub read_timeout: Option<u64>,
    #[serde(default)]
    pub decode: DecodePolicy,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            read_timeout: None,
            decode: DecodePolicy::default(),
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
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5001
}

fn default_backlog() -> u32 {
    128
}

fn default_buffer_size() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub buffer_size: usize,
    pub read_timeout: Option<Duration>,
    pub decode: DecodePolicy,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents =
                std::fs::read_to_string(config_path).map_err(|source| ConfigError::FileRead {
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

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.listener.host),
            port: cli.port.unwrap_or(toml_config.listener.port),
            backlog: cli.backlog.unwrap_or(toml_config.listener.backlog),
            buffer_size: cli
                .buffer_size
                .unwrap_or(toml_config.connection.buffer_size),
            read_timeout: cli
                .read_timeout
                .or(toml_config.connection.read_timeout)
                .map(Duration::from_secs),
            decode: cli.decode.unwrap_or(toml_config.connection.decode),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be greater than 0".into()));
        }
        if self.backlog == 0 {
            return Err(ConfigError::Invalid("backlog must be greater than 0".into()));
        }
        if self.read_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::Invalid("read_timeout must be greater than 0".into()));
        }
        Ok(())
    }

    /// The `host:port` string the listener binds to.
    pub fn listen_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}
