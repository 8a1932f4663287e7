//! Configuration loading traits and types.
//!
//! This module provides a standardized way to load TOML configuration files
//! for the device engine and the simulator.
//!
//! # Usage
//!
//! ```rust,no_run
//! use leep_common::config::{ConfigLoader, DeviceConfig, ConfigError};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = DeviceConfig::load(Path::new("device.toml"))?;
//!     config.validate()?;
//!     println!("Device: {}", config.name);
//!     Ok(())
//! }
//! ```
//!
//! # TOML Example
//!
//! ```toml
//! name = "cavity1"
//! peer = "192.168.1.20"
//! bind = "0.0.0.0:0"
//! log_level = "debug"
//!
//! [session]
//! timeout_ms = 500
//! max_in_flight = 4
//!
//! [[registers]]
//! name = "scratch"
//! base_addr = 0x10
//! ```

use crate::consts::{
    DEFAULT_BIND, DEFAULT_MAX_IN_FLIGHT, DEFAULT_PORT, DEFAULT_RECONNECT_BACKOFF_MS,
    DEFAULT_TIMEOUT_MS, DEFAULT_UDP_HEADER_SIZE, MAX_FRAME_SLOTS,
};
use crate::regmap::RegisterInfo;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Error type for configuration loading operations.
///
/// This enum represents all possible errors that can occur when loading
/// or validating configuration.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Represents the verbosity level of logging output.
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information.
    Trace,
    /// Debug information useful during development.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Trait for loading configuration from TOML files.
///
/// This trait provides a default implementation that works with any type
/// implementing `serde::de::DeserializeOwned`.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Blanket implementation for all types that implement DeserializeOwned.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

// ─── Peer address ───────────────────────────────────────────────────

/// A peer given as host name or IP literal, with optional port.
///
/// Accepted forms: `host`, `host:port`, `a.b.c.d`, `a.b.c.d:port`,
/// `::1`, `[::1]` and `[::1]:port`. The port defaults to [`DEFAULT_PORT`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    /// Host name or IP literal (without brackets).
    pub host: String,
    /// UDP port.
    pub port: u16,
}

impl PeerAddress {
    /// Socket address if the host is an IP literal.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }

    /// `host:port` string for name resolution.
    pub fn lookup_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for PeerAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || ConfigError::ValidationError(format!("Invalid peer address '{s}'"));
        if s.is_empty() {
            return Err(invalid());
        }

        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self {
                host: addr.ip().to_string(),
                port: addr.port(),
            });
        }
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(Self {
                host: ip.to_string(),
                port: DEFAULT_PORT,
            });
        }
        if let Some(inner) = s.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
            let ip: IpAddr = inner.parse().map_err(|_| invalid())?;
            return Ok(Self {
                host: ip.to_string(),
                port: DEFAULT_PORT,
            });
        }

        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (s, DEFAULT_PORT),
        };
        let valid_host = !host.is_empty()
            && host
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'));
        if !valid_host {
            return Err(invalid());
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

// ─── Device configuration ───────────────────────────────────────────

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_reconnect_backoff_ms() -> u64 {
    DEFAULT_RECONNECT_BACKOFF_MS
}

fn default_max_in_flight() -> usize {
    DEFAULT_MAX_IN_FLIGHT
}

fn default_udp_header_size() -> usize {
    DEFAULT_UDP_HEADER_SIZE
}

/// Timing and flow-control settings of one device session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Reply timeout per frame, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Delay before reconnecting after a session error, in milliseconds.
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,

    /// Frames outstanding at once (1..=255).
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Handshake attempts before giving up and backing off; 0 retries forever.
    #[serde(default)]
    pub probe_retries: u32,

    /// Link overhead added per received datagram to the byte counter.
    #[serde(default = "default_udp_header_size")]
    pub udp_header_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            reconnect_backoff_ms: DEFAULT_RECONNECT_BACKOFF_MS,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            probe_retries: 0,
            udp_header_size: DEFAULT_UDP_HEADER_SIZE,
        }
    }
}

impl SessionConfig {
    /// Reply timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Reconnect backoff.
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    /// Validate the session settings.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - `timeout_ms` is 0
    /// - `max_in_flight` is outside 1..=255
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "timeout_ms must be greater than 0".to_string(),
            ));
        }
        if !(1..=MAX_FRAME_SLOTS).contains(&self.max_in_flight) {
            return Err(ConfigError::ValidationError(format!(
                "max_in_flight {} outside 1..={}",
                self.max_in_flight, MAX_FRAME_SLOTS
            )));
        }
        Ok(())
    }
}

/// Configuration consumed when a device is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device name (registry key).
    pub name: String,

    /// Local bind address; any interface, any port by default.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Peer to connect to; the device stays disconnected when unset.
    #[serde(default)]
    pub peer: Option<String>,

    /// Debug category bit set; all categories when unset.
    #[serde(default)]
    pub debug: Option<u32>,

    /// Logging verbosity for binaries embedding the device.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Session timing.
    #[serde(default)]
    pub session: SessionConfig,

    /// Registers with a fixed address mapping.
    #[serde(default)]
    pub registers: Vec<RegisterInfo>,
}

impl DeviceConfig {
    /// Configuration with defaults for everything but the name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bind: default_bind(),
            peer: None,
            debug: None,
            log_level: LogLevel::default(),
            session: SessionConfig::default(),
            registers: Vec::new(),
        }
    }

    /// Parsed local bind address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind.parse().map_err(|_| {
            ConfigError::ValidationError(format!("Invalid bind address '{}'", self.bind))
        })
    }

    /// Parsed peer, `None` when unset or empty.
    pub fn peer_address(&self) -> Result<Option<PeerAddress>, ConfigError> {
        match self.peer.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(p) => p.parse().map(Some),
        }
    }

    /// Validate the device configuration.
    ///
    /// # Validation Rules
    /// 1. `name` not empty
    /// 2. `bind` is a socket address
    /// 3. `peer`, if set, is a valid peer address
    /// 4. session settings valid
    /// 5. static registers valid and uniquely named
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::ValidationError(
                "name cannot be empty".to_string(),
            ));
        }
        self.bind_addr()?;
        self.peer_address()?;
        self.session.validate()?;

        let mut seen = std::collections::HashSet::new();
        for reg in &self.registers {
            reg.validate()
                .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
            if !seen.insert(reg.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate register name: {}",
                    reg.name
                )));
            }
        }
        Ok(())
    }
}

// ─── Simulator configuration ────────────────────────────────────────

/// One bit of one register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitRef {
    /// Register name.
    pub register: String,
    /// Bit index (0..32).
    #[serde(default)]
    pub bit: u32,
}

/// A derived-data rule for the waveform simulator logic.
///
/// Setting `reset.bit` fills `buffer` with generated samples for the
/// channels selected by `mask` (or `valid` without a mask register), then
/// sets `status.bit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveformRuleConfig {
    /// Rule name for logs.
    pub name: String,
    /// Trigger register and bit.
    pub reset: BitRef,
    /// Ready register and bit.
    pub status: BitRef,
    /// Data buffer register.
    pub buffer: String,
    /// Default channel selection.
    pub valid: u32,
    /// Register overriding `valid`.
    #[serde(default)]
    pub mask: Option<String>,
}

/// Simulator configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Logging verbosity.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Waveform rules; the built-in presets are used when empty.
    #[serde(default)]
    pub rules: Vec<WaveformRuleConfig>,
}

impl SimulatorConfig {
    /// Validate rule bit indices.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for rule in &self.rules {
            for bit in [&rule.reset, &rule.status] {
                if bit.bit >= 32 {
                    return Err(ConfigError::ValidationError(format!(
                        "Rule '{}': bit {} of '{}' out of range",
                        rule.name, bit.bit, bit.register
                    )));
                }
            }
        }
        Ok(())
    }
}
