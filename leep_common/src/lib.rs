//! LEEP Common Library
//!
//! This crate provides the protocol pieces shared by the device session
//! engine and the simulator: the stateless wire codec, the JSON register
//! map, ROM descriptors and the TOML configuration types.
//!
//! # Module Structure
//!
//! - [`consts`] - Protocol constants (magic, limits, addresses, defaults)
//! - [`wire`] - Frame encode/decode and element-width conversion
//! - [`regmap`] - JSON register map parsing
//! - [`rom`] - ROM descriptor image parse/build and zlib helpers
//! - [`config`] - Configuration loading traits and types
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use leep_common::prelude::*;
//!
//! let frame = encode_request(0x0100_0001, 0x10, false, &[0, 0]).unwrap();
//! assert_eq!(frame.len(), MIN_FRAME_BYTES);
//! ```

pub mod config;
pub mod consts;
pub mod prelude;
pub mod regmap;
pub mod rom;
pub mod wire;
