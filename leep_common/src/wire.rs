//! Wire codec for the LEEP register protocol.
//!
//! Pure functions mapping register words to and from the on-wire byte
//! layout. No state is kept here; sequencing and matching of replies to
//! outstanding requests belong to the device session.
//!
//! # Frame Layout
//!
//! ```text
//!  0        4        8                 8+8n
//!  +--------+--------+--------+--------+ ... +--------+--------+
//!  | magic  |  seq   |cmd_addr|  data  |     |cmd_addr|  data  |
//!  +--------+--------+--------+--------+ ... +--------+--------+
//!     header            command 0               command n-1
//! ```
//!
//! All words are big-endian. A frame carries between [`MIN_COMMANDS`] and
//! [`MAX_COMMANDS`] commands; requests shorter than the minimum are padded
//! with reads of [`PAD_ADDRESS`].

use crate::consts::{
    ADDRESS_MASK, COMMAND_SIZE, FRAME_MAGIC, MAX_COMMANDS, MAX_FRAME_BYTES, MIN_COMMANDS,
    MIN_FRAME_BYTES, PAD_ADDRESS, READ_FLAG, REPLY_COMPARE_MASK, STATUS_MASK, UNUSED_MASK,
};
use thiserror::Error;

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Frame shorter than the protocol minimum.
    #[error("Frame too short: {len} bytes (min {MIN_FRAME_BYTES})")]
    TooShort { len: usize },

    /// Frame longer than the protocol maximum.
    #[error("Frame too long: {len} bytes (max {MAX_FRAME_BYTES})")]
    TooLong { len: usize },

    /// Length is not a whole number of commands.
    #[error("Frame length {len} is not a multiple of {COMMAND_SIZE}")]
    Misaligned { len: usize },

    /// Header magic does not match.
    #[error("Bad frame magic {found:#010x}")]
    BadMagic { found: u32 },

    /// More commands than fit in one frame.
    #[error("Too many commands: {count} (max {MAX_COMMANDS})")]
    TooManyCommands { count: usize },

    /// Reply sequence differs from the request.
    #[error("Sequence mismatch: expected {expected:#010x}, found {found:#010x}")]
    SequenceMismatch { expected: u32, found: u32 },

    /// Reply carries a different number of commands than the request.
    #[error("Command count mismatch: expected {expected}, found {found}")]
    CommandCountMismatch { expected: usize, found: usize },

    /// A reply command does not echo its request.
    #[error("Command {index} mismatch: expected {expected:#010x}, found {found:#010x}")]
    CommandMismatch {
        index: usize,
        expected: u32,
        found: u32,
    },

    /// Address range leaves the 24-bit address space.
    #[error("Address {address:#x} (+{count}) outside the 24-bit address space")]
    AddressOutOfRange { address: u32, count: usize },

    /// Register element width with no defined byte order.
    #[error("Unsupported element width: {bits} bits")]
    UnsupportedWidth { bits: u32 },
}

/// Result alias for codec operations.
pub type WireResult<T> = Result<T, WireError>;

// ─── Commands ───────────────────────────────────────────────────────

/// One 8-byte command: `cmd_addr` then `data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    /// Read flag, status nibble and 24-bit address.
    pub cmd_addr: u32,
    /// Written value, or the value read in a reply.
    pub data: u32,
}

impl Command {
    /// Read of one word.
    pub const fn read(address: u32) -> Self {
        Self {
            cmd_addr: READ_FLAG | (address & ADDRESS_MASK),
            data: 0,
        }
    }

    /// Write of one word.
    pub const fn write(address: u32, value: u32) -> Self {
        Self {
            cmd_addr: address & ADDRESS_MASK,
            data: value,
        }
    }

    /// Filler command used to reach the minimum frame size.
    pub const fn padding() -> Self {
        Self::read(PAD_ADDRESS)
    }

    /// Word address addressed by this command.
    pub const fn address(&self) -> u32 {
        self.cmd_addr & ADDRESS_MASK
    }

    /// True for reads.
    pub const fn is_read(&self) -> bool {
        self.cmd_addr & READ_FLAG != 0
    }

    /// Device status nibble (replies only).
    pub const fn status(&self) -> u8 {
        ((self.cmd_addr & STATUS_MASK) >> 24) as u8
    }

    /// Bits that must be clear in a well-formed request.
    pub const fn unused_bits(&self) -> u32 {
        self.cmd_addr & UNUSED_MASK
    }

    /// True if `reply` echoes this command, ignoring the status nibble.
    pub const fn is_echoed_by(&self, reply: &Command) -> bool {
        (self.cmd_addr & REPLY_COMPARE_MASK) == (reply.cmd_addr & REPLY_COMPARE_MASK)
    }
}

// ─── Frames ─────────────────────────────────────────────────────────

/// A decoded request or reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sequence word echoed by the peer.
    pub sequence: u32,
    /// Commands in wire order.
    pub commands: Vec<Command>,
}

impl Frame {
    /// Create a frame from a sequence word and commands.
    pub fn new(sequence: u32, commands: Vec<Command>) -> Self {
        Self { sequence, commands }
    }

    /// Append padding reads until the frame reaches the minimum size.
    pub fn pad(&mut self) {
        while self.commands.len() < MIN_COMMANDS {
            self.commands.push(Command::padding());
        }
    }

    /// Encoded size in bytes, padding included.
    pub fn encoded_len(&self) -> usize {
        (self.commands.len().max(MIN_COMMANDS) + 1) * COMMAND_SIZE
    }

    /// Serialize to bytes, padding to the minimum size.
    ///
    /// # Errors
    /// Returns `WireError::TooManyCommands` above [`MAX_COMMANDS`].
    pub fn encode(&self) -> WireResult<Vec<u8>> {
        if self.commands.len() > MAX_COMMANDS {
            return Err(WireError::TooManyCommands {
                count: self.commands.len(),
            });
        }

        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&FRAME_MAGIC.to_be_bytes());
        out.extend_from_slice(&self.sequence.to_be_bytes());
        for cmd in &self.commands {
            out.extend_from_slice(&cmd.cmd_addr.to_be_bytes());
            out.extend_from_slice(&cmd.data.to_be_bytes());
        }
        for _ in self.commands.len()..MIN_COMMANDS {
            let pad = Command::padding();
            out.extend_from_slice(&pad.cmd_addr.to_be_bytes());
            out.extend_from_slice(&pad.data.to_be_bytes());
        }
        Ok(out)
    }

    /// Parse a frame, validating length and magic.
    ///
    /// Nothing is returned for a frame that fails any check, so a caller
    /// never sees a partially decoded frame.
    pub fn decode(bytes: &[u8]) -> WireResult<Self> {
        let len = bytes.len();
        if len < MIN_FRAME_BYTES {
            return Err(WireError::TooShort { len });
        }
        if len > MAX_FRAME_BYTES {
            return Err(WireError::TooLong { len });
        }
        if len % COMMAND_SIZE != 0 {
            return Err(WireError::Misaligned { len });
        }

        let magic = be_word(&bytes[0..4]);
        if magic != FRAME_MAGIC {
            return Err(WireError::BadMagic { found: magic });
        }
        let sequence = be_word(&bytes[4..8]);

        let commands = bytes[COMMAND_SIZE..]
            .chunks_exact(COMMAND_SIZE)
            .map(|c| Command {
                cmd_addr: be_word(&c[0..4]),
                data: be_word(&c[4..8]),
            })
            .collect();

        Ok(Self { sequence, commands })
    }

    /// OR of the status nibbles of all commands.
    pub fn status(&self) -> u8 {
        self.commands.iter().fold(0, |acc, c| acc | c.status())
    }

    /// Check that `reply` answers this request command for command.
    ///
    /// The request must already be padded (see [`Frame::pad`]).
    pub fn match_reply(&self, reply: &Frame) -> WireResult<()> {
        if reply.sequence != self.sequence {
            return Err(WireError::SequenceMismatch {
                expected: self.sequence,
                found: reply.sequence,
            });
        }
        if reply.commands.len() != self.commands.len() {
            return Err(WireError::CommandCountMismatch {
                expected: self.commands.len(),
                found: reply.commands.len(),
            });
        }
        for (index, (req, rep)) in self.commands.iter().zip(&reply.commands).enumerate() {
            if !req.is_echoed_by(rep) {
                return Err(WireError::CommandMismatch {
                    index,
                    expected: req.cmd_addr & REPLY_COMPARE_MASK,
                    found: rep.cmd_addr & REPLY_COMPARE_MASK,
                });
            }
        }
        Ok(())
    }
}

/// Encode a request for consecutive words starting at `address`.
///
/// For writes, `words` are the values written. For reads only the length
/// of `words` matters: one read is issued per element.
pub fn encode_request(
    sequence: u32,
    address: u32,
    is_write: bool,
    words: &[u32],
) -> WireResult<Vec<u8>> {
    check_range(address, words.len())?;
    let commands = words
        .iter()
        .enumerate()
        .map(|(i, &w)| {
            let addr = address + i as u32;
            if is_write {
                Command::write(addr, w)
            } else {
                Command::read(addr)
            }
        })
        .collect();
    Frame::new(sequence, commands).encode()
}

/// Decoded reply payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Sequence word echoed by the peer.
    pub sequence: u32,
    /// OR of all command status nibbles; 0 means success.
    pub status: u8,
    /// `data` of every command in wire order, padding included.
    pub words: Vec<u32>,
}

/// Decode a reply frame into its sequence, status and data words.
pub fn decode_reply(bytes: &[u8]) -> WireResult<Reply> {
    let frame = Frame::decode(bytes)?;
    Ok(Reply {
        sequence: frame.sequence,
        status: frame.status(),
        words: frame.commands.iter().map(|c| c.data).collect(),
    })
}

/// Reject ranges that leave the 24-bit address space.
pub fn check_range(address: u32, count: usize) -> WireResult<()> {
    let end = address as u64 + count as u64;
    if address > ADDRESS_MASK || end > ADDRESS_MASK as u64 + 1 {
        return Err(WireError::AddressOutOfRange { address, count });
    }
    Ok(())
}

fn be_word(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

// ─── Element widths ─────────────────────────────────────────────────

/// Width of the elements a register's words are viewed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementWidth {
    /// Two elements per word, high half first.
    Bits16,
    /// One element per word.
    Bits32,
}

impl ElementWidth {
    /// Map a width in bits. Widths other than 16 and 32 are rejected.
    pub fn from_bits(bits: u32) -> WireResult<Self> {
        match bits {
            16 => Ok(Self::Bits16),
            32 => Ok(Self::Bits32),
            _ => Err(WireError::UnsupportedWidth { bits }),
        }
    }

    /// Width in bits.
    pub const fn bits(self) -> u32 {
        match self {
            Self::Bits16 => 16,
            Self::Bits32 => 32,
        }
    }

    /// Number of elements packed in one word.
    pub const fn per_word(self) -> usize {
        match self {
            Self::Bits16 => 2,
            Self::Bits32 => 1,
        }
    }
}

/// Register contents viewed at a given element width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Elements {
    /// 16-bit elements.
    U16(Vec<u16>),
    /// 32-bit elements.
    U32(Vec<u32>),
}

impl Elements {
    /// Unpack words in network order.
    pub fn from_words(words: &[u32], width: ElementWidth) -> Self {
        match width {
            ElementWidth::Bits16 => Self::U16(
                words
                    .iter()
                    .flat_map(|&w| [(w >> 16) as u16, w as u16])
                    .collect(),
            ),
            ElementWidth::Bits32 => Self::U32(words.to_vec()),
        }
    }

    /// Pack back into words; an odd trailing 16-bit element fills the high half.
    pub fn to_words(&self) -> Vec<u32> {
        match self {
            Self::U16(v) => v
                .chunks(2)
                .map(|pair| {
                    let hi = pair[0] as u32;
                    let lo = pair.get(1).copied().unwrap_or(0) as u32;
                    (hi << 16) | lo
                })
                .collect(),
            Self::U32(v) => v.clone(),
        }
    }

    /// Element width of this view.
    pub fn width(&self) -> ElementWidth {
        match self {
            Self::U16(_) => ElementWidth::Bits16,
            Self::U32(_) => ElementWidth::Bits32,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            Self::U16(v) => v.len(),
            Self::U32(v) => v.len(),
        }
    }

    /// True if there are no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Serialize words in network byte order.
pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

/// Parse network-order bytes into words.
pub fn bytes_to_words(bytes: &[u8]) -> WireResult<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        return Err(WireError::Misaligned { len: bytes.len() });
    }
    Ok(bytes.chunks_exact(4).map(be_word).collect())
}
