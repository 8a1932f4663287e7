//! Device ROM descriptors.
//!
//! A LEEP device publishes its identity in a read-only block of 16-bit
//! values (one per 32-bit word, upper half unused). The block is a list
//! of descriptors, each a header `type << 14 | size` followed by `size`
//! payload values:
//!
//! | type | payload |
//! |------|---------|
//! | 0 | end of ROM |
//! | 1 | text; the first is the device description |
//! | 2 | big integer; the first is the JSON hash, the second the code hash |
//! | 3 | zlib-compressed JSON register map |

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::io::{Read, Write};
use thiserror::Error;
use tracing::warn;

/// Largest payload of a single descriptor, in 16-bit values.
pub const MAX_DESCRIPTOR_SIZE: usize = 0x3fff;

/// Errors from ROM parsing and building.
#[derive(Debug, Error)]
pub enum RomError {
    /// Descriptor payload runs past the end of the image.
    #[error("Truncated ROM descriptor at word {offset} (size {size})")]
    Truncated { offset: usize, size: usize },

    /// No JSON descriptor in the image.
    #[error("ROM contains no JSON")]
    NoJson,

    /// Image does not fit the ROM region.
    #[error("ROM image needs {needed} words but only {capacity} are available")]
    TooLarge { needed: usize, capacity: usize },

    /// Single descriptor over the size limit.
    #[error("ROM descriptor of {size} values exceeds {MAX_DESCRIPTOR_SIZE}")]
    DescriptorTooLarge { size: usize },

    /// Big integer text is not hexadecimal.
    #[error("Invalid ROM big integer '{0}'")]
    BadBigInt(String),

    /// JSON payload is not UTF-8 after decompression.
    #[error("ROM JSON is not valid UTF-8")]
    NotUtf8,

    /// zlib failure.
    #[error("ROM compression error: {0}")]
    Compression(#[from] std::io::Error),
}

/// One ROM descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RomDescriptor {
    /// Free text.
    Text(String),
    /// Big integer, as lowercase hex.
    BigInt(String),
    /// Decompressed JSON document.
    Json(String),
}

impl RomDescriptor {
    fn type_code(&self) -> u16 {
        match self {
            Self::Text(_) => 1,
            Self::BigInt(_) => 2,
            Self::Json(_) => 3,
        }
    }

    fn payload(&self) -> Result<Vec<u16>, RomError> {
        match self {
            Self::Text(text) => Ok(bytes_to_values(text.as_bytes())),
            Self::BigInt(hex) => {
                let width = hex.len().div_ceil(4) * 4;
                let padded = format!("{hex:0>width$}");
                padded
                    .as_bytes()
                    .chunks(4)
                    .map(|chunk| {
                        std::str::from_utf8(chunk)
                            .ok()
                            .and_then(|s| u16::from_str_radix(s, 16).ok())
                            .ok_or_else(|| RomError::BadBigInt(hex.clone()))
                    })
                    .collect()
            }
            Self::Json(json) => Ok(bytes_to_values(&compress(json.as_bytes())?)),
        }
    }
}

/// A parsed or to-be-built ROM image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rom {
    descriptors: Vec<RomDescriptor>,
}

impl Rom {
    /// Empty ROM.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: append a descriptor.
    pub fn with(mut self, descriptor: RomDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Append a descriptor.
    pub fn push(&mut self, descriptor: RomDescriptor) {
        self.descriptors.push(descriptor);
    }

    /// All descriptors in image order.
    pub fn descriptors(&self) -> &[RomDescriptor] {
        &self.descriptors
    }

    /// First text descriptor.
    pub fn description(&self) -> Option<&str> {
        self.descriptors.iter().find_map(|d| match d {
            RomDescriptor::Text(t) => Some(t.as_str()),
            _ => None,
        })
    }

    fn big_int(&self, n: usize) -> Option<&str> {
        self.descriptors
            .iter()
            .filter_map(|d| match d {
                RomDescriptor::BigInt(h) => Some(h.as_str()),
                _ => None,
            })
            .nth(n)
    }

    /// First big integer descriptor.
    pub fn json_hash(&self) -> Option<&str> {
        self.big_int(0)
    }

    /// Second big integer descriptor.
    pub fn code_hash(&self) -> Option<&str> {
        self.big_int(1)
    }

    /// First JSON descriptor.
    pub fn json(&self) -> Option<&str> {
        self.descriptors.iter().find_map(|d| match d {
            RomDescriptor::Json(j) => Some(j.as_str()),
            _ => None,
        })
    }

    /// Parse ROM words. Only the low 16 bits of each word are used.
    ///
    /// # Errors
    /// Truncated descriptors, bad JSON compression, or an image with no
    /// JSON descriptor.
    pub fn parse(words: &[u32]) -> Result<Self, RomError> {
        let values: Vec<u16> = words.iter().map(|&w| w as u16).collect();
        let mut rom = Self::new();
        let mut pos = 0;

        while pos < values.len() {
            let header = values[pos];
            let kind = header >> 14;
            let size = (header & 0x3fff) as usize;
            if kind == 0 {
                break;
            }

            let start = pos + 1;
            let end = start + size;
            if end > values.len() {
                return Err(RomError::Truncated { offset: pos, size });
            }
            let payload = &values[start..end];
            pos = end;

            let descriptor = match kind {
                1 => RomDescriptor::Text(values_to_text(payload)),
                2 => RomDescriptor::BigInt(payload.iter().map(|v| format!("{v:04x}")).collect()),
                _ => {
                    if rom.json().is_some() {
                        warn!("Ignoring additional JSON blob in ROM");
                        continue;
                    }
                    let raw = decompress(&values_to_bytes(payload))?;
                    RomDescriptor::Json(String::from_utf8(raw).map_err(|_| RomError::NotUtf8)?)
                }
            };
            rom.push(descriptor);
        }

        if rom.json().is_none() {
            return Err(RomError::NoJson);
        }
        Ok(rom)
    }

    /// Encode into exactly `capacity` words, zero filled after the last
    /// descriptor.
    pub fn encode(&self, capacity: usize) -> Result<Vec<u32>, RomError> {
        let mut out = Vec::with_capacity(capacity);
        for descriptor in &self.descriptors {
            let payload = descriptor.payload()?;
            if payload.len() > MAX_DESCRIPTOR_SIZE {
                return Err(RomError::DescriptorTooLarge {
                    size: payload.len(),
                });
            }
            out.push(((descriptor.type_code() << 14) | payload.len() as u16) as u32);
            out.extend(payload.into_iter().map(u32::from));
        }
        if out.len() > capacity {
            return Err(RomError::TooLarge {
                needed: out.len(),
                capacity,
            });
        }
        out.resize(capacity, 0);
        Ok(out)
    }
}

/// zlib-compress a buffer.
pub fn compress(bytes: &[u8]) -> Result<Vec<u8>, RomError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

/// Inflate a zlib stream; bytes after the end of the stream are ignored.
pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>, RomError> {
    let mut out = Vec::new();
    ZlibDecoder::new(bytes).read_to_end(&mut out)?;
    Ok(out)
}

fn bytes_to_values(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|c| u16::from_be_bytes([c[0], c.get(1).copied().unwrap_or(0)]))
        .collect()
}

fn values_to_bytes(values: &[u16]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

fn values_to_text(values: &[u16]) -> String {
    let bytes = values_to_bytes(values);
    let trimmed: &[u8] = match bytes.iter().rposition(|&b| b != 0) {
        Some(last) => &bytes[..=last],
        None => &[],
    };
    String::from_utf8_lossy(trimmed).into_owned()
}
