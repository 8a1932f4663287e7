//! Prelude module for common re-exports.
//!
//! This module provides convenient re-exports of commonly used types
//! so that consumers can do `use leep_common::prelude::*;` and get
//! the most important types without listing individual paths.
//!
//! # Usage
//!
//! ```rust
//! use leep_common::prelude::*;
//! ```

// ─── Logging ────────────────────────────────────────────────────────
pub use crate::config::LogLevel;

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{
    ConfigError, ConfigLoader, DeviceConfig, PeerAddress, SessionConfig, SimulatorConfig,
};

// ─── Protocol Constants ─────────────────────────────────────────────
pub use crate::consts::{
    DEFAULT_PORT, FRAME_MAGIC, MAX_COMMANDS, MAX_FRAME_BYTES, MIN_COMMANDS, MIN_FRAME_BYTES,
};

// ─── Wire Codec ─────────────────────────────────────────────────────
pub use crate::wire::{
    Command, ElementWidth, Elements, Frame, Reply, WireError, WireResult, decode_reply,
    encode_request,
};

// ─── Register Map / ROM ─────────────────────────────────────────────
pub use crate::regmap::{Access, RegMapError, RegisterInfo, RegisterMap};
pub use crate::rom::{Rom, RomDescriptor, RomError};
