//! Configuration module for linefile.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;

use crate::locator::PortRange;
use crate::protocol::ContentNewlines;
use crate::store::DEFAULT_DIRECTORY;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "linefile")]
#[command(author = "linefile authors")]
#[command(version = "0.1.0")]
#[command(about = "Store and fetch short text files over a line protocol", long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub mode: Mode,

    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Port range to scan, e.g. 23525-23529
    #[arg(short = 'p', long, global = true)]
    pub ports: Option<PortRange>,

    /// Host the client connects to
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Address the server binds to
    #[arg(long, global = true)]
    pub bind: Option<String>,

    /// Directory the server keeps files in
    #[arg(short = 'd', long, global = true)]
    pub directory: Option<PathBuf>,

    /// How the client shows escaped newlines in received content
    #[arg(long, value_enum, global = true)]
    pub content_newlines: Option<ContentNewlines>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Which side to run
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Serve one client from the storage directory
    Server,
    /// Connect to a server and issue commands interactively
    Client,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network-related configuration
#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    /// Ports tried in ascending order
    #[serde(default)]
    pub ports: PortRange,
    /// Host the client connects to
    #[serde(default = "default_host")]
    pub host: String,
    /// Address the server binds to
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ports: PortRange::default(),
            host: default_host(),
            bind: default_bind(),
        }
    }
}

/// Storage-related configuration
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize, Default)]
pub struct ClientConfig {
    #[serde(default)]
    pub content_newlines: ContentNewlines,
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
    "localhost".to_string()
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_directory() -> PathBuf {
    PathBuf::from(DEFAULT_DIRECTORY)
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub ports: PortRange,
    pub host: String,
    pub bind: String,
    pub directory: PathBuf,
    pub content_newlines: ContentNewlines,
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

        Ok(Self::merge(cli, toml_config))
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            mode: cli.mode,
            ports: cli.ports.unwrap_or(toml_config.network.ports),
            host: cli.host.unwrap_or(toml_config.network.host),
            bind: cli.bind.unwrap_or(toml_config.network.bind),
            directory: cli.directory.unwrap_or(toml_config.storage.directory),
            content_newlines: cli
                .content_newlines
                .unwrap_or(toml_config.client.content_newlines),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
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
