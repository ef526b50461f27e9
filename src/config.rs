//! Configuration module for the chat server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::serializer::DEFAULT_MAX_FIELD_LEN;
use crate::runtime::SessionLimits;

/// Command-line arguments for the chat server
#[derive(Parser, Debug, Default)]
#[command(name = "chat-server")]
#[command(author = "chat-server authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP chat server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:25565)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Total thread count: one dispatch thread plus workers (minimum 2)
    #[arg(short = 't', long)]
    pub max_threads: Option<usize>,

    /// Readiness poll timeout in milliseconds
    #[arg(long)]
    pub poll_timeout_ms: Option<u64>,

    /// Faults tolerated before a connection is reaped
    #[arg(long)]
    pub max_fail_count: Option<u32>,

    /// Reap connections idle for this many seconds (0 = never)
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error) [default: info]
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

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Total thread count, dispatch thread included
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_threads: default_max_threads(),
        }
    }
}

/// Per-connection configuration
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_max_fail_count")]
    pub max_fail_count: u32,
    /// 0 disables idle reaping
    #[serde(default)]
    pub idle_timeout_secs: u64,
    /// Largest accepted length prefix in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout_ms(),
            max_fail_count: default_max_fail_count(),
            idle_timeout_secs: 0,
            max_frame_size: default_max_frame_size(),
            write_timeout_ms: default_write_timeout_ms(),
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
    "127.0.0.1:25565".to_string()
}

fn default_max_threads() -> usize {
    4
}

fn default_poll_timeout_ms() -> u64 {
    250
}

fn default_max_fail_count() -> u32 {
    3
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FIELD_LEN
}

fn default_write_timeout_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub max_threads: usize,
    pub poll_timeout_ms: u64,
    pub max_fail_count: u32,
    pub idle_timeout_secs: u64,
    pub max_frame_size: usize,
    pub write_timeout_ms: u64,
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

    /// Resolve already-parsed CLI args against their TOML file, if any.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            max_threads: cli.max_threads.unwrap_or(toml_config.server.max_threads),
            poll_timeout_ms: cli
                .poll_timeout_ms
                .unwrap_or(toml_config.session.poll_timeout_ms),
            max_fail_count: cli
                .max_fail_count
                .unwrap_or(toml_config.session.max_fail_count),
            idle_timeout_secs: cli
                .idle_timeout_secs
                .unwrap_or(toml_config.session.idle_timeout_secs),
            max_frame_size: toml_config.session.max_frame_size,
            write_timeout_ms: toml_config.session.write_timeout_ms,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    /// Reject values no server could run with.
    ///
    /// Thread capacity is checked by `Server::new`, which owns that rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "poll_timeout_ms",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "write_timeout_ms",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.max_frame_size == 0 || self.max_frame_size > u32::MAX as usize {
            return Err(ConfigError::Invalid {
                field: "max_frame_size",
                reason: format!("must be between 1 and {}", u32::MAX),
            });
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            max_fail_count: self.max_fail_count,
            idle_timeout: (self.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(self.idle_timeout_secs)),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid { field: &'static str, reason: String },
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
            ConfigError::Invalid { field, reason } => {
                write!(f, "Invalid configuration value '{}': {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
