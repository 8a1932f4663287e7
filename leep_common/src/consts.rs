//! Protocol constants for the LEEP register protocol.
//!
//! Single source of truth for frame limits, well-known addresses and
//! session defaults. Imported by all crates.

use static_assertions::const_assert_eq;

// ─── Frame layout ───────────────────────────────────────────────────

/// Magic word opening every request and reply.
pub const FRAME_MAGIC: u32 = 0xfeed_c0de;

/// Size of the header and of every command, in bytes.
pub const COMMAND_SIZE: usize = 8;

/// Fewest commands a frame may carry; shorter requests are padded.
pub const MIN_COMMANDS: usize = 3;

/// Most commands a frame may carry.
pub const MAX_COMMANDS: usize = 127;

/// Smallest valid frame (header + 3 commands).
pub const MIN_FRAME_BYTES: usize = (MIN_COMMANDS + 1) * COMMAND_SIZE;

/// Largest valid frame (header + 127 commands).
pub const MAX_FRAME_BYTES: usize = (MAX_COMMANDS + 1) * COMMAND_SIZE;

const_assert_eq!(MIN_FRAME_BYTES, 32);
const_assert_eq!(MAX_FRAME_BYTES, 1024);

/// `cmd_addr` bit selecting a read.
pub const READ_FLAG: u32 = 0x1000_0000;

/// `cmd_addr` bits holding the word address.
pub const ADDRESS_MASK: u32 = 0x00ff_ffff;

/// `cmd_addr` bits a device may set in a reply (status nibble).
pub const STATUS_MASK: u32 = 0x0f00_0000;

/// Mask applied to `cmd_addr` when matching a reply against its request.
pub const REPLY_COMPARE_MASK: u32 = !STATUS_MASK;

/// `cmd_addr` bits that must be clear in a request.
pub const UNUSED_MASK: u32 = 0xef00_0000;

/// Address used for padding commands.
pub const PAD_ADDRESS: u32 = 0;

/// Bits of the sequence word carrying the send counter; the top byte is the frame slot.
pub const SEQUENCE_COUNTER_MASK: u32 = 0x00ff_ffff;

/// Shift of the frame slot index within the sequence word.
pub const SEQUENCE_SLOT_SHIFT: u32 = 24;

/// Most frame slots addressable through the sequence word.
pub const MAX_FRAME_SLOTS: usize = 255;

// ─── Well-known registers ───────────────────────────────────────────

/// Base address of the greeting register.
pub const HELLO_ADDRESS: u32 = 0;

/// Contents of the greeting register: "Hello World!\r\n\r\n".
pub const HELLO_WORDS: [u32; 4] = [0x4865_6c6c, 0x6f20_576f, 0x726c_6421, 0x0d0a_0d0a];

/// Address of the small ROM, also probed to detect the large one.
pub const ROM_2K_ADDRESS: u32 = 0x800;

/// Size of the small ROM in words.
pub const ROM_2K_WORDS: usize = 0x800;

/// Address of the large ROM.
pub const ROM_16K_ADDRESS: u32 = 0x4000;

/// Size of the large ROM in words.
pub const ROM_16K_WORDS: usize = 0x4000;

/// Value returned by the simulator for reads of unmapped addresses.
pub const UNMAPPED_READ_VALUE: u32 = 0xabad_face;

// ─── Session defaults ───────────────────────────────────────────────

/// Default UDP port of a LEEP device.
pub const DEFAULT_PORT: u16 = 50006;

/// Default local bind address: any interface, any port.
pub const DEFAULT_BIND: &str = "0.0.0.0:0";

/// Default reply timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Default delay before reconnecting after a session error, in milliseconds.
pub const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 1000;

/// Default number of frames outstanding at once.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 1;

/// Per-datagram Ethernet/IP/UDP overhead added to the received byte counter.
pub const DEFAULT_UDP_HEADER_SIZE: usize = 42;

/// Number of round-trip samples kept per device.
pub const RTT_HISTORY: usize = 100;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_consistent() {
        assert_eq!(READ_FLAG & ADDRESS_MASK, 0);
        assert_eq!(STATUS_MASK & ADDRESS_MASK, 0);
        assert_eq!(REPLY_COMPARE_MASK, 0xf0ff_ffff);
        assert_eq!(UNUSED_MASK & READ_FLAG, 0);
        assert!(MAX_FRAME_SLOTS <= (u32::MAX >> SEQUENCE_SLOT_SHIFT) as usize);
    }

    #[test]
    fn rom_regions_do_not_overlap() {
        assert!(ROM_2K_ADDRESS as usize + ROM_2K_WORDS <= ROM_16K_ADDRESS as usize);
        assert!(HELLO_ADDRESS as usize + HELLO_WORDS.len() <= ROM_2K_ADDRESS as usize);
    }
}
