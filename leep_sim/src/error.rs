//! Simulator error types.

use leep_common::config::ConfigError;
use leep_common::regmap::RegMapError;
use leep_common::rom::RomError;
use thiserror::Error;

/// Errors raised while building or running a simulator.
#[derive(Debug, Error)]
pub enum SimError {
    /// Two registers share a name.
    #[error("Duplicate register name: {0}")]
    DuplicateRegister(String),

    /// Logic refers to a register missing from the image.
    #[error("No register {0}")]
    UnknownRegister(String),

    /// Register present but unusable by the selected logic.
    #[error("Register {name}: {reason}")]
    BadRegister { name: String, reason: String },

    /// Malformed line in an initial values file.
    #[error("Error on line {line} of initial values: '{content}'")]
    InitialValues { line: usize, content: String },

    /// Register map problem.
    #[error(transparent)]
    RegMap(#[from] RegMapError),

    /// ROM image problem.
    #[error(transparent)]
    Rom(#[from] RomError),

    /// Configuration problem.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Socket or file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for simulator operations.
pub type SimResult<T> = Result<T, SimError>;
