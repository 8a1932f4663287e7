//! Error types of the device session engine.

use crate::register::RegisterStatus;
use leep_common::config::ConfigError;
use leep_common::regmap::RegMapError;
use leep_common::rom::RomError;
use leep_common::wire::WireError;
use thiserror::Error;

/// Why a register operation could not be queued.
///
/// Rejection is synchronous and leaves all state unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// An operation is already in flight on the register.
    #[error("register busy")]
    Busy,

    /// The device is not connected.
    #[error("device not connected")]
    NotConnected,

    /// No register of that name exists.
    #[error("unknown register")]
    UnknownRegister,

    /// The register has no address mapping yet.
    #[error("register not mapped")]
    NotMapped,

    /// The register does not accept writes.
    #[error("register not writable")]
    NotWritable,

    /// The register does not accept reads.
    #[error("register not readable")]
    NotReadable,

    /// The word range lies outside the register.
    #[error("word range out of bounds")]
    OutOfRange,
}

/// Device session errors.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Invalid configuration or peer address.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Request rejected at queue time.
    #[error("Request rejected: {0}")]
    Rejected(#[from] QueueError),

    /// No register with this name.
    #[error("Unknown register: {0}")]
    UnknownRegister(String),

    /// Frame encoding or element conversion failed.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// ROM image could not be parsed.
    #[error("ROM: {0}")]
    Rom(#[from] RomError),

    /// Register map from the ROM is invalid.
    #[error("Register map: {0}")]
    RegMap(#[from] RegMapError),

    /// Info blob serialization failed.
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Socket or thread setup failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A completed operation did not succeed.
    #[error("{register}: {status}")]
    Failed {
        /// Register name.
        register: String,
        /// Outcome recorded on the register.
        status: RegisterStatus,
    },

    /// Gave up waiting for a completion or connection.
    #[error("Timed out waiting for {0}")]
    WaitTimeout(String),
}

/// Result type for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;
