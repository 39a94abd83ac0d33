//! Configuration module for the chat broadcaster.
//!
//! The listen port is the only required input. Everything else has a
//! default and may come from CLI flags or an optional TOML file; CLI
//! arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

/// Session backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Readiness-based acceptor with one thread per session.
    #[default]
    Mio,
    /// Async accept loop with one task pair per session.
    Tokio,
}

/// Command-line arguments for the broadcaster
#[derive(Parser, Debug)]
#[command(name = "chat-broadcast")]
#[command(author = "chat-broadcast authors")]
#[command(version = "0.1.0")]
#[command(about = "A multi-client TCP line broadcaster", long_about = None)]
pub struct CliArgs {
    /// Port to listen on (number or TCP service name)
    pub port: String,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (defaults to all local addresses)
    #[arg(long)]
    pub host: Option<String>,

    /// Maximum concurrent sessions (0 = unbounded)
    #[arg(short = 'm', long)]
    pub max_sessions: Option<usize>,

    /// Session runtime
    #[arg(short = 'r', long, value_enum)]
    pub runtime: Option<RuntimeType>,

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
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Maximum concurrent sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Session runtime
    #[serde(default)]
    pub runtime: RuntimeType,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            max_sessions: default_max_sessions(),
            runtime: RuntimeType::default(),
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_max_sessions() -> usize {
    20
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub max_sessions: usize,
    pub runtime: RuntimeType,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they name, if any.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let host = cli.host.unwrap_or(toml_config.server.host);
        let ip: IpAddr = host
            .parse()
            .map_err(|_| ConfigError::InvalidHost(host.clone()))?;
        let port = resolve_port(&cli.port)?;

        Ok(Config {
            listen: SocketAddr::new(ip, port),
            max_sessions: cli
                .max_sessions
                .unwrap_or(toml_config.server.max_sessions),
            runtime: cli.runtime.unwrap_or(toml_config.server.runtime),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Resolve a port given as a number or a TCP service name.
pub fn resolve_port(port: &str) -> Result<u16, ConfigError> {
    if let Ok(number) = port.parse::<u16>() {
        return Ok(number);
    }
    lookup_service(port).ok_or_else(|| ConfigError::UnknownPort(port.to_string()))
}

#[cfg(unix)]
fn lookup_service(name: &str) -> Option<u16> {
    let name = std::ffi::CString::new(name).ok()?;
    let proto = std::ffi::CString::new("tcp").ok()?;

    // getservbyname returns static storage; it is only called during
    // startup, before any other thread exists.
    unsafe {
        let entry = libc::getservbyname(name.as_ptr(), proto.as_ptr());
        if entry.is_null() {
            return None;
        }
        // s_port holds the port in network byte order in its low 16 bits.
        Some(u16::from_be((*entry).s_port as u16))
    }
}

#[cfg(not(unix))]
fn lookup_service(_name: &str) -> Option<u16> {
    None
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidHost(String),
    UnknownPort(String),
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
            ConfigError::InvalidHost(host) => write!(f, "Invalid listen address '{host}'"),
            ConfigError::UnknownPort(port) => {
                write!(f, "Unknown port or service name '{port}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
