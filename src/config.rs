//! Configuration module for tcp-gateway.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the gateway
#[derive(Parser, Debug, Default)]
#[command(name = "tcp-gateway")]
#[command(version)]
#[command(about = "TCP server with an optional layer-4 reverse proxy", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:8083)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Downstream address to proxy to; without it the greeting handler runs
    #[arg(short = 't', long)]
    pub target: Option<String>,

    /// Read deadline after accept in milliseconds (0 = none)
    #[arg(long)]
    pub read_timeout_ms: Option<u64>,

    /// Write deadline after accept in milliseconds (0 = none)
    #[arg(long)]
    pub write_timeout_ms: Option<u64>,

    /// Downstream dial timeout in milliseconds (0 = none)
    #[arg(long)]
    pub dial_timeout_ms: Option<u64>,

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
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and accepted-connection settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub read_timeout_ms: u64,
    #[serde(default)]
    pub write_timeout_ms: u64,
    /// TCP keep-alive period for accepted connections
    #[serde(default)]
    pub keep_alive_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            read_timeout_ms: 0,
            write_timeout_ms: 0,
            keep_alive_secs: 0,
        }
    }
}

/// Reverse proxy settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    /// Downstream address; empty disables the proxy
    #[serde(default)]
    pub target: String,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
    #[serde(default = "default_proxy_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            dial_timeout_ms: default_dial_timeout_ms(),
            deadline_ms: default_deadline_ms(),
            keep_alive_secs: default_proxy_keep_alive_secs(),
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
    "127.0.0.1:8083".to_string()
}

fn default_dial_timeout_ms() -> u64 {
    10_000
}

fn default_deadline_ms() -> u64 {
    60_000
}

fn default_proxy_keep_alive_secs() -> u64 {
    3600
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub keep_alive: Duration,
    pub proxy: Option<ProxySettings>,
    pub log_level: String,
}

/// Resolved reverse proxy settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    pub target: String,
    pub dial_timeout: Duration,
    pub deadline: Duration,
    pub keep_alive_period: Duration,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge CLI args over the TOML file they name, if any.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
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

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        if listen.is_empty() {
            return Err(ConfigError::Invalid("listen address must not be empty"));
        }

        let target = cli.target.unwrap_or(toml_config.proxy.target);
        let proxy = (!target.is_empty()).then(|| ProxySettings {
            target,
            dial_timeout: Duration::from_millis(
                cli.dial_timeout_ms
                    .unwrap_or(toml_config.proxy.dial_timeout_ms),
            ),
            deadline: Duration::from_millis(toml_config.proxy.deadline_ms),
            keep_alive_period: Duration::from_secs(toml_config.proxy.keep_alive_secs),
        });

        Ok(Config {
            listen,
            read_timeout: Duration::from_millis(
                cli.read_timeout_ms
                    .unwrap_or(toml_config.server.read_timeout_ms),
            ),
            write_timeout: Duration::from_millis(
                cli.write_timeout_ms
                    .unwrap_or(toml_config.server.write_timeout_ms),
            ),
            keep_alive: Duration::from_secs(toml_config.server.keep_alive_secs),
            proxy,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {1}", path = .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{path}': {1}", path = .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
