//! Configuration module for crlf-tap.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::listener::{ConnectionOptions, DecodePolicy, ListenerOptions, DEFAULT_BACKLOG};
use crate::sink::SinkType;
use crate::splitter::Delimiter;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments for the listener
#[derive(Parser, Debug)]
#[command(name = "crlf-tap")]
#[command(author = "crlf-tap authors")]
#[command(version = "0.1.0")]
#[command(about = "Split inbound TCP streams into delimiter-terminated records", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1)
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Port to bind to (0 picks a free port)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Record delimiter
    #[arg(short, long, value_enum)]
    pub delimiter: Option<Delimiter>,

    /// What to do with chunks that are not valid UTF-8
    #[arg(long, value_enum)]
    pub decode_error: Option<DecodePolicy>,

    /// Bytes requested per socket read
    #[arg(long)]
    pub read_buffer_size: Option<usize>,

    /// Largest unterminated record kept before the connection is closed
    #[arg(long)]
    pub max_record_size: Option<usize>,

    /// Where records go
    #[arg(short, long, value_enum)]
    pub sink: Option<SinkType>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: None,
            backlog: default_backlog(),
        }
    }
}

/// Per-connection configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub delimiter: Delimiter,
    #[serde(default)]
    pub decode_error: DecodePolicy,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_max_record_size")]
    pub max_record_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            delimiter: Delimiter::default(),
            decode_error: DecodePolicy::default(),
            read_buffer_size: default_read_buffer_size(),
            max_record_size: default_max_record_size(),
        }
    }
}

/// Output configuration
#[derive(Debug, Deserialize, Default)]
pub struct OutputConfig {
    #[serde(default)]
    pub sink: SinkType,
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8443
}

fn default_backlog() -> i32 {
    DEFAULT_BACKLOG
}

fn default_read_buffer_size() -> usize {
    crate::listener::DEFAULT_READ_BUFFER_SIZE
}

fn default_max_record_size() -> usize {
    crate::splitter::DEFAULT_MAX_RECORD_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub workers: Option<usize>,
    pub backlog: i32,
    pub delimiter: Delimiter,
    pub decode_error: DecodePolicy,
    pub read_buffer_size: usize,
    pub max_record_size: usize,
    pub sink: SinkType,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve already-parsed CLI args against the TOML file they name, if any.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let config = Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            workers: cli.workers.or(toml_config.server.workers),
            backlog: toml_config.server.backlog,
            delimiter: cli.delimiter.unwrap_or(toml_config.connection.delimiter),
            decode_error: cli
                .decode_error
                .unwrap_or(toml_config.connection.decode_error),
            read_buffer_size: cli
                .read_buffer_size
                .unwrap_or(toml_config.connection.read_buffer_size),
            max_record_size: cli
                .max_record_size
                .unwrap_or(toml_config.connection.max_record_size),
            sink: cli.sink.unwrap_or(toml_config.output.sink),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".to_string()));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "read_buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.max_record_size == 0 {
            return Err(ConfigError::Invalid(
                "max_record_size must be greater than zero".to_string(),
            ));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid(
                "workers must be greater than zero".to_string(),
            ));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid(
                "backlog must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Listener settings derived from this configuration.
    pub fn listener_options(&self) -> ListenerOptions {
        ListenerOptions {
            connection: ConnectionOptions {
                delimiter: self.delimiter,
                decode_policy: self.decode_error,
                read_buffer_size: self.read_buffer_size,
                max_record_size: self.max_record_size,
            },
            backlog: self.backlog,
        }
    }
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
