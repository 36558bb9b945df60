//! Configuration module for the ws-fanout server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "ws-fanout")]
#[command(author = "ws-fanout authors")]
#[command(version = "0.1.0")]
#[command(about = "A WebSocket echo benchmark server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:3000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of duplicate sends issued per inbound message
    #[arg(short = 'f', long)]
    pub write_factor: Option<usize>,

    /// Per-connection buffered-write ceiling in bytes
    #[arg(short = 'b', long)]
    pub max_backpressure: Option<usize>,

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
    pub echo: EchoConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
        }
    }
}

/// Echo behavior configuration
#[derive(Debug, Deserialize)]
pub struct EchoConfig {
    /// Duplicate sends per inbound message
    #[serde(default = "default_write_factor")]
    pub write_factor: usize,
    /// Buffered-write ceiling per connection in bytes
    #[serde(default = "default_max_backpressure")]
    pub max_backpressure: usize,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            write_factor: default_write_factor(),
            max_backpressure: default_max_backpressure(),
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
    "0.0.0.0:3000".to_string()
}

fn default_write_factor() -> usize {
    4
}

fn default_max_backpressure() -> usize {
    256 * 1024 // 256 KiB
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub write_factor: usize,
    pub max_backpressure: usize,
    pub workers: Option<usize>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::resolve(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence) and validate.
    pub fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let config = Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            write_factor: cli
                .write_factor
                .unwrap_or(toml_config.echo.write_factor),
            max_backpressure: cli
                .max_backpressure
                .unwrap_or(toml_config.echo.max_backpressure),
            workers: cli.workers.or(toml_config.server.workers),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        if config.write_factor == 0 {
            return Err(ConfigError::Invalid("write_factor must be at least 1"));
        }
        if config.max_backpressure == 0 {
            return Err(ConfigError::Invalid("max_backpressure must be at least 1"));
        }

        Ok(config)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}
