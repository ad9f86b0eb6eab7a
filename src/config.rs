//! Configuration module for framed-server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::codec::DEFAULT_MAX_FRAME_SIZE;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "framed-server")]
#[command(author = "framed-server authors")]
#[command(version = "0.1.0")]
#[command(about = "A length-prefixed framed TCP server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7878)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of runtime worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Application service answering each frame
    #[arg(short = 's', long, value_enum)]
    pub service: Option<ServiceKind>,

    /// What to do when the service fails a request
    #[arg(long, value_enum)]
    pub on_service_error: Option<OnServiceError>,

    /// Maximum number of concurrent sessions
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Maximum frame payload size in bytes
    #[arg(short = 'm', long)]
    pub max_frame_size: Option<usize>,

    /// Close a session after this long without a new frame (milliseconds)
    #[arg(long)]
    pub idle_timeout_ms: Option<u64>,

    /// Deadline for completing a frame once it started arriving (milliseconds)
    #[arg(long)]
    pub read_timeout_ms: Option<u64>,

    /// Deadline for writing one response frame (milliseconds)
    #[arg(long)]
    pub write_timeout_ms: Option<u64>,

    /// How long shutdown waits for sessions to drain (milliseconds)
    #[arg(long)]
    pub shutdown_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Built-in application services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Return every payload unchanged.
    #[default]
    Echo,
    /// Answer `PING` with `PONG`.
    Ping,
}

/// Policy for service failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OnServiceError {
    /// Close the session without a response.
    #[default]
    Close,
    /// Send the service's error reply as a frame, if it provided one.
    Respond,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
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
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Service answering frames
    #[serde(default)]
    pub service: ServiceKind,
    /// Service failure policy
    #[serde(default)]
    pub on_service_error: OnServiceError,
    /// Delay before retrying a transiently failed accept
    #[serde(default = "default_accept_retry_delay_ms")]
    pub accept_retry_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            backlog: default_backlog(),
            service: ServiceKind::default(),
            on_service_error: OnServiceError::default(),
            accept_retry_delay_ms: default_accept_retry_delay_ms(),
        }
    }
}

/// Resource limits
#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    /// Maximum frame payload size in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Maximum number of concurrent sessions
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_size: default_max_frame_size(),
            max_connections: default_max_connections(),
        }
    }
}

/// Session and shutdown deadlines
#[derive(Debug, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Abort sessions still alive when the shutdown timeout expires
    #[serde(default = "default_true")]
    pub force_close_on_timeout: bool,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            force_close_on_timeout: true,
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
    "127.0.0.1:7878".to_string()
}

fn default_backlog() -> i32 {
    1024
}

fn default_accept_retry_delay_ms() -> u64 {
    100
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_max_connections() -> usize {
    10_000
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_read_timeout_ms() -> u64 {
    30_000
}

fn default_write_timeout_ms() -> u64 {
    5_000
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub workers: Option<usize>,
    pub backlog: i32,
    pub service: ServiceKind,
    pub on_service_error: OnServiceError,
    pub max_connections: usize,
    pub max_frame_size: usize,
    pub idle_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub accept_retry_delay: Duration,
    pub force_close_on_timeout: bool,
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
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve already-parsed CLI args, reading the TOML file they name.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
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

    fn merge(cli: CliArgs, file: TomlConfig) -> Self {
        let ms = Duration::from_millis;

        Config {
            listen: cli.listen.unwrap_or(file.server.listen),
            workers: cli.workers.or(file.server.workers),
            backlog: file.server.backlog,
            service: cli.service.unwrap_or(file.server.service),
            on_service_error: cli
                .on_service_error
                .unwrap_or(file.server.on_service_error),
            max_connections: cli
                .max_connections
                .unwrap_or(file.limits.max_connections),
            max_frame_size: cli.max_frame_size.unwrap_or(file.limits.max_frame_size),
            idle_timeout: ms(cli
                .idle_timeout_ms
                .unwrap_or(file.timeouts.idle_timeout_ms)),
            read_timeout: ms(cli
                .read_timeout_ms
                .unwrap_or(file.timeouts.read_timeout_ms)),
            write_timeout: ms(cli
                .write_timeout_ms
                .unwrap_or(file.timeouts.write_timeout_ms)),
            shutdown_timeout: ms(cli
                .shutdown_timeout_ms
                .unwrap_or(file.timeouts.shutdown_timeout_ms)),
            accept_retry_delay: ms(file.server.accept_retry_delay_ms),
            force_close_on_timeout: file.timeouts.force_close_on_timeout,
            log_level: cli.log_level.unwrap_or(file.logging.level),
        }
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_size == 0 || self.max_frame_size > u32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "max_frame_size must be between 1 and {}",
                u32::MAX
            )));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid("backlog must be positive".to_string()));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid(
                "workers must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("idle_timeout", self.idle_timeout),
            ("read_timeout", self.read_timeout),
            ("write_timeout", self.write_timeout),
            ("shutdown_timeout", self.shutdown_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {1}", path = .0.display())]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{path}': {1}", path = .0.display())]
    TomlParse(PathBuf, toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
