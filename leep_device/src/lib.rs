//! # LEEP Device Library
//!
//! Session engine for register-addressable LEEP devices over UDP: the
//! connection state machine, the per-register request queue with
//! asynchronous completion, and the background driver owning the socket.
//!
//! # Module Structure
//!
//! - [`session`] - `Device` handle: requests, control, observers
//! - [`register`] - Register status, severity and snapshots
//! - [`waiter`] - Completion waiter trait and implementations
//! - [`status`] - Connection state, counters, debug categories
//! - [`registry`] - Device registry keyed by name
//! - [`error`] - `DeviceError` and `QueueError`
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        leep_device                               │
//! │  callers ──► Device ──lock──► SessionCore ◄──lock── driver       │
//! │   (any        │  queue/write     │ registers        │ thread     │
//! │   thread)     │  reset/set_peer  │ send queue       │ (tokio)    │
//! │               │                  │ frame slots      │            │
//! │               ▼                  ▼                  ▼            │
//! │            Notify ──────────────────────────► select! {        │
//! │                                                 intent,          │
//! │                                                 datagram,        │
//! │                                                 timer }          │
//! │   waiters ◄── notified after unlock ◄───────────────┘            │
//! └──────────────────────────────────────────────────────────────────┘
//!                                   │ UDP (leep_common::wire)
//!                                   ▼
//!                          device or leep_sim
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use leep_device::{ChannelWaiter, DeviceConfig, registry};
//! use std::sync::mpsc;
//! use std::time::Duration;
//!
//! let mut config = DeviceConfig::new("llrf");
//! config.peer = Some("192.168.1.20".to_string());
//! let device = registry::get_or_create_device(config).unwrap();
//! device.wait_connected(Duration::from_secs(5)).unwrap();
//!
//! let (tx, rx) = mpsc::channel();
//! device.attach("scratch", Box::new(ChannelWaiter::new(tx)));
//! assert!(device.queue("scratch", false));
//! let (_, completion) = rx.recv().unwrap();
//! println!("{:?} {:?}", completion.status, device.register("scratch"));
//! ```

#![deny(missing_docs)]

mod core;
mod driver;
pub mod error;
pub mod register;
pub mod registry;
pub mod session;
pub mod status;
pub mod waiter;

pub use crate::core::{HELLO_REGISTER, ROM_2K_REGISTER, ROM_16K_REGISTER, ROM_PROBE_REGISTER};
pub use crate::error::{DeviceError, DeviceResult, QueueError};
pub use crate::register::{Direction, RegisterOrigin, RegisterSnapshot, RegisterStatus, Severity};
pub use crate::registry::DeviceRegistry;
pub use crate::session::Device;
pub use crate::status::{ConnectionState, Counters, DebugFlags, DeviceIdentity, RttStats};
pub use crate::waiter::{ChannelWaiter, Completion, FnWaiter, OneshotWaiter, Waiter, WaiterId};
pub use leep_common::config::{DeviceConfig, PeerAddress, SessionConfig};
pub use leep_common::wire::{ElementWidth, Elements};
