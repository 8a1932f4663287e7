//! Connection state, counters and diagnostics of a device.

use bitflags::bitflags;
use leep_common::consts::RTT_HISTORY;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

/// Session state machine.
///
/// ```text
///  DISCONNECTED ──► RESOLVING ──► BINDING ──► CONNECTED
///        ▲              │            │            │
///        └──────────────┴── error / reset ────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// No session; waiting for a peer or for the backoff to expire.
    #[default]
    Disconnected,
    /// Peer name resolution in progress.
    Resolving,
    /// Handshake (probe and ROM read) in progress.
    Binding,
    /// Register map loaded; user requests accepted.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Resolving => "RESOLVING",
            Self::Binding => "BINDING",
            Self::Connected => "CONNECTED",
        })
    }
}

/// Traffic and error counters of one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    /// Frames sent.
    pub sent: u64,
    /// Datagrams received.
    pub received: u64,
    /// Bytes received, per-datagram header overhead included.
    pub received_bytes: u64,
    /// Datagrams dropped as unexpected or mismatched.
    pub ignored: u64,
    /// Frames that timed out.
    pub timeouts: u64,
    /// Session errors (transport, handshake, reported).
    pub errors: u64,
    /// Send sequence counter.
    pub send_sequence: u32,
}

bitflags! {
    /// Trace categories enabled for a device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DebugFlags: u32 {
        /// Peer resolution, connect and reset.
        const CONNECTION = 1 << 0;
        /// Frames sent and received.
        const PACKETS    = 1 << 1;
        /// ROM descriptors and register announcements.
        const ROM        = 1 << 2;
        /// Register state changes.
        const STATE      = 1 << 3;
        /// Driver loop wakeups.
        const LOOP       = 1 << 4;
        /// Queue accept/reject.
        const QUEUE      = 1 << 5;
    }
}

impl Default for DebugFlags {
    fn default() -> Self {
        Self::all()
    }
}

/// Ring of the most recent frame round-trip times.
#[derive(Debug, Clone, Default)]
pub struct RoundTrip {
    samples: VecDeque<Duration>,
}

impl RoundTrip {
    /// Record one round trip, dropping the oldest beyond [`RTT_HISTORY`].
    pub fn push(&mut self, rtt: Duration) {
        if self.samples.len() == RTT_HISTORY {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt);
    }

    /// Summary of the recorded samples.
    pub fn stats(&self) -> RttStats {
        let count = self.samples.len();
        if count == 0 {
            return RttStats::default();
        }
        let total: Duration = self.samples.iter().sum();
        RttStats {
            samples: count,
            min: self.samples.iter().min().copied().unwrap_or_default(),
            max: self.samples.iter().max().copied().unwrap_or_default(),
            mean: total / count as u32,
        }
    }
}

/// Round-trip time summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RttStats {
    /// Number of samples (at most [`RTT_HISTORY`]).
    pub samples: usize,
    /// Fastest round trip.
    pub min: Duration,
    /// Slowest round trip.
    pub max: Duration,
    /// Mean round trip.
    pub mean: Duration,
}

/// Identity read from the device ROM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    /// First text descriptor.
    pub description: String,
    /// Hash of the register map JSON.
    pub json_hash: String,
    /// Hash of the firmware sources.
    pub code_hash: String,
}
