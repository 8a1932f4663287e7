//! LEEP device simulator.
//!
//! A protocol-compatible stand-in for a LEEP device. It answers the same
//! frames a real device does, keeps a register image built from a JSON
//! register map, and optionally emulates firmware side effects.
//!
//! # Module Structure
//!
//! - [`image`] - Register image (`SimImage`, `SimRegister`) and ROM contents
//! - [`logic`] - Write side effects (`SimLogic` trait and variants)
//! - [`initial`] - Initial values file
//! - [`simulator`] - UDP server and pure frame handler
//! - [`error`] - Error types
//!
//! # Example
//!
//! ```rust,no_run
//! use leep_sim::{LogicKind, SimImage, Simulator, build_logic};
//!
//! let image = SimImage::from_json(r#"{"scratch": {"base_addr": 16}}"#, false)?;
//! let logic = build_logic(LogicKind::None, &image, &[])?;
//! let sim = Simulator::bind("127.0.0.1:0".parse().unwrap(), image, logic)?.spawn()?;
//! println!("listening on {}", sim.local_addr());
//! # Ok::<(), leep_sim::SimError>(())
//! ```

pub mod error;
pub mod image;
pub mod initial;
pub mod logic;
pub mod simulator;

pub use error::{SimError, SimResult};
pub use image::{SimImage, SimRegister};
pub use initial::InitialValues;
pub use logic::{LogicKind, SimLogic, build_logic};
pub use simulator::{GHOST_REGISTER, Simulator, SimulatorHandle};
