//! Configuration for the respwire client.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::memory::{BlockPool, PoolOptions, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use crate::runtime::ClientOptions;

/// Protocol version negotiated during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    /// No `HELLO`; replies and pub/sub messages use RESP2 shapes.
    Resp2,
    /// `HELLO 3` on connect.
    #[default]
    Resp3,
}

/// Command-line arguments for the client
#[derive(Parser, Debug)]
#[command(name = "respwire")]
#[command(author = "respwire authors")]
#[command(version = "0.1.0")]
#[command(about = "Send one command to a RESP3 server and print the reply", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Server address (e.g., 127.0.0.1:6379)
    #[arg(short, long)]
    pub address: Option<String>,

    /// Protocol version to negotiate
    #[arg(short, long, value_enum)]
    pub protocol: Option<ProtocolVersion>,

    /// Username for AUTH / HELLO AUTH
    #[arg(short, long)]
    pub username: Option<String>,

    /// Password for AUTH / HELLO AUTH
    #[arg(long)]
    pub password: Option<String>,

    /// Command timeout in milliseconds (0 = no timeout)
    #[arg(short = 't', long)]
    pub timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Command and arguments to send (defaults to PING)
    #[arg(trailing_var_arg = true)]
    pub command: Vec<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection-related configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default)]
    pub protocol: ProtocolVersion,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// 0 disables command timeouts
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_timeout_check_interval_ms")]
    pub timeout_check_interval_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            protocol: ProtocolVersion::default(),
            username: None,
            password: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            timeout_check_interval_ms: default_timeout_check_interval_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

/// Block pool configuration
#[derive(Debug, Deserialize)]
pub struct MemoryConfig {
    /// Size of blocks the socket reads into
    #[serde(default = "default_block_size")]
    pub incoming_block_size: usize,
    /// Size of blocks commands are encoded into
    #[serde(default = "default_block_size")]
    pub outgoing_block_size: usize,
    /// Record outstanding leases for leak scans
    #[serde(default = "default_track_leases")]
    pub track_leases: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            incoming_block_size: default_block_size(),
            outgoing_block_size: default_block_size(),
            track_leases: default_track_leases(),
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

fn default_address() -> String {
    "127.0.0.1:6379".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_command_timeout_ms() -> u64 {
    5000
}

fn default_timeout_check_interval_ms() -> u64 {
    1000
}

fn default_reconnect_delay_ms() -> u64 {
    500
}

fn default_block_size() -> usize {
    128 * 1024 // 128 KiB
}

fn default_track_leases() -> bool {
    cfg!(debug_assertions)
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub address: String,
    pub protocol: ProtocolVersion,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub timeout_check_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    pub incoming_block_size: usize,
    pub outgoing_block_size: usize,
    pub track_leases: bool,
    pub log_level: String,
    pub command: Vec<String>,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::Io(config_path.clone(), e))?;
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let connection = toml_config.connection;
        let config = Config {
            address: cli.address.unwrap_or(connection.address),
            protocol: cli.protocol.unwrap_or(connection.protocol),
            username: cli.username.or(connection.username),
            password: cli.password.or(connection.password),
            connect_timeout_ms: connection.connect_timeout_ms,
            command_timeout_ms: cli.timeout_ms.unwrap_or(connection.command_timeout_ms),
            timeout_check_interval_ms: connection.timeout_check_interval_ms,
            reconnect_delay_ms: connection.reconnect_delay_ms,
            incoming_block_size: toml_config.memory.incoming_block_size,
            outgoing_block_size: toml_config.memory.outgoing_block_size,
            track_leases: toml_config.memory.track_leases,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
            command: cli.command,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the client cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.is_empty() {
            return Err(ConfigError::Invalid("address must not be empty".to_string()));
        }
        for (name, size) in [
            ("incoming_block_size", self.incoming_block_size),
            ("outgoing_block_size", self.outgoing_block_size),
        ] {
            if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&size) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be between {MIN_BLOCK_SIZE} and {MAX_BLOCK_SIZE} bytes, got {size}"
                )));
            }
        }
        if self.timeout_check_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "timeout_check_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Connection settings for [`crate::Client::connect`].
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            address: self.address.clone(),
            protocol: self.protocol,
            username: self.username.clone(),
            password: self.password.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            command_timeout: (self.command_timeout_ms > 0)
                .then(|| Duration::from_millis(self.command_timeout_ms)),
            timeout_check_interval: Duration::from_millis(self.timeout_check_interval_ms),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            incoming_block_size: self.incoming_block_size,
            outgoing_block_size: self.outgoing_block_size,
            pool: BlockPool::new(PoolOptions {
                track_leases: self.track_leases,
            }),
            ..ClientOptions::default()
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {1}", .0.display())]
    Parse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("respwire").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.connection.address, "127.0.0.1:6379");
        assert_eq!(config.connection.protocol, ProtocolVersion::Resp3);
        assert_eq!(config.connection.command_timeout_ms, 5000);
        assert_eq!(config.memory.incoming_block_size, 128 * 1024);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [connection]
            address = "10.0.0.1:6380"
            protocol = "resp2"
            password = "secret"
            command_timeout_ms = 0

            [memory]
            incoming_block_size = 65536
            track_leases = true

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.connection.address, "10.0.0.1:6380");
        assert_eq!(config.connection.protocol, ProtocolVersion::Resp2);
        assert_eq!(config.connection.password.as_deref(), Some("secret"));
        assert_eq!(config.connection.command_timeout_ms, 0);
        assert_eq!(config.connection.reconnect_delay_ms, 500);
        assert_eq!(config.memory.incoming_block_size, 65536);
        assert_eq!(config.memory.outgoing_block_size, 128 * 1024);
        assert!(config.memory.track_leases);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides() {
        let config = Config::from_args(parse(&[
            "-a",
            "example:7000",
            "--protocol",
            "resp2",
            "--timeout-ms",
            "0",
            "GET",
            "key",
        ]))
        .unwrap();
        assert_eq!(config.address, "example:7000");
        assert_eq!(config.protocol, ProtocolVersion::Resp2);
        assert_eq!(config.command, vec!["GET", "key"]);

        let options = config.client_options();
        assert_eq!(options.command_timeout, None);
        assert_eq!(options.timeout_check_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::from_args(parse(&[])).unwrap();
        assert!(config.validate().is_ok());

        config.incoming_block_size = 16;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.incoming_block_size = 4096;
        config.timeout_check_interval_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = Config::from_args(parse(&["--config", "/nonexistent/respwire.toml"]));
        match result {
            Err(ConfigError::Io(path, _)) => assert_eq!(path, PathBuf::from("/nonexistent/respwire.toml")),
            other => panic!("Expected Io error, got {other:?}"),
        }
    }
}
