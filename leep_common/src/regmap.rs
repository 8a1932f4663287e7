//! JSON register map.
//!
//! A LEEP device describes its registers with a JSON object embedded in
//! its ROM. The same document drives the simulator's register image.
//!
//! ```json
//! {
//!     "circle_buf_flip": {"access": "w", "addr_width": 0, "base_addr": 327704,
//!                         "data_width": 2, "sign": "unsigned"},
//!     "__metadata__": {"git_sha": "0000"}
//! }
//! ```

use crate::consts::ADDRESS_MASK;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors from register map parsing.
#[derive(Debug, Error)]
pub enum RegMapError {
    /// Document is not valid JSON.
    #[error("Invalid register map JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Top level is not an object.
    #[error("Register map must be a JSON object")]
    NotAnObject,

    /// An entry could not be decoded.
    #[error("Register '{name}': {source}")]
    Entry {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    /// An entry decoded but is inconsistent.
    #[error("Register '{name}': {reason}")]
    Invalid { name: String, reason: String },
}

/// Access mode of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Access {
    /// Read only.
    #[serde(rename = "r")]
    Read,
    /// Write only.
    #[serde(rename = "w")]
    Write,
    /// Read and write.
    #[default]
    #[serde(rename = "rw")]
    ReadWrite,
}

impl Access {
    /// True if reads are allowed.
    pub const fn readable(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    /// True if writes are allowed.
    pub const fn writable(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// Signedness of register values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Sign {
    #[default]
    Unsigned,
    Signed,
}

fn default_data_width() -> u32 {
    32
}

/// Address mapping and attributes of one register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterInfo {
    /// Register name; filled from the map key when parsed from JSON.
    #[serde(default)]
    pub name: String,

    /// First word address.
    pub base_addr: u32,

    /// log2 of the number of words.
    #[serde(default)]
    pub addr_width: u32,

    /// Significant bits per word.
    #[serde(default = "default_data_width")]
    pub data_width: u32,

    /// Access mode.
    #[serde(default)]
    pub access: Access,

    /// Signedness.
    #[serde(default)]
    pub sign: Sign,

    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl RegisterInfo {
    /// Build a read/write 32-bit register.
    pub fn new(name: impl Into<String>, base_addr: u32, addr_width: u32) -> Self {
        Self {
            name: name.into(),
            base_addr,
            addr_width,
            data_width: 32,
            access: Access::ReadWrite,
            sign: Sign::Unsigned,
            description: None,
        }
    }

    /// Builder: set the access mode.
    pub fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    /// Builder: set the data width.
    pub fn with_data_width(mut self, data_width: u32) -> Self {
        self.data_width = data_width;
        self
    }

    /// Number of words.
    pub fn word_count(&self) -> usize {
        1usize << self.addr_width
    }

    /// Mask of significant bits in each word.
    pub fn mask(&self) -> u32 {
        if self.data_width >= 32 {
            u32::MAX
        } else {
            (1u32 << self.data_width) - 1
        }
    }

    /// True if `address` falls inside this register.
    pub fn contains(&self, address: u32) -> bool {
        address >= self.base_addr && ((address - self.base_addr) as usize) < self.word_count()
    }

    /// Check widths and address range.
    pub fn validate(&self) -> Result<(), RegMapError> {
        let invalid = |reason: String| RegMapError::Invalid {
            name: self.name.clone(),
            reason,
        };
        if self.name.is_empty() {
            return Err(invalid("name cannot be empty".to_string()));
        }
        if self.addr_width > 24 {
            return Err(invalid(format!(
                "addr_width {} exceeds 24",
                self.addr_width
            )));
        }
        if !(1..=32).contains(&self.data_width) {
            return Err(invalid(format!(
                "data_width {} outside 1..=32",
                self.data_width
            )));
        }
        let end = self.base_addr as u64 + self.word_count() as u64;
        if end > ADDRESS_MASK as u64 + 1 {
            return Err(invalid(format!(
                "base_addr {:#x} with addr_width {} overflows the address space",
                self.base_addr, self.addr_width
            )));
        }
        Ok(())
    }
}

/// Parsed register map, ordered by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegisterMap {
    registers: BTreeMap<String, RegisterInfo>,
    metadata: BTreeMap<String, serde_json::Value>,
}

impl RegisterMap {
    /// Parse a JSON register map.
    ///
    /// Keys starting with `__` are kept as metadata; every other key must
    /// be a register entry.
    pub fn parse(json: &str) -> Result<Self, RegMapError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let serde_json::Value::Object(object) = value else {
            return Err(RegMapError::NotAnObject);
        };

        let mut map = Self::default();
        for (name, entry) in object {
            if name.starts_with("__") {
                map.metadata.insert(name, entry);
                continue;
            }
            let mut info: RegisterInfo =
                serde_json::from_value(entry).map_err(|source| RegMapError::Entry {
                    name: name.clone(),
                    source,
                })?;
            info.name = name.clone();
            info.validate()?;
            map.registers.insert(name, info);
        }
        Ok(map)
    }

    /// Add or replace a register.
    pub fn insert(&mut self, info: RegisterInfo) -> Result<(), RegMapError> {
        info.validate()?;
        self.registers.insert(info.name.clone(), info);
        Ok(())
    }

    /// Look up a register by name.
    pub fn get(&self, name: &str) -> Option<&RegisterInfo> {
        self.registers.get(name)
    }

    /// Registers in name order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisterInfo> {
        self.registers.values()
    }

    /// Metadata entries (`__` keys).
    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    /// Number of registers.
    pub fn len(&self) -> usize {
        self.registers.len()
    }

    /// True if the map has no registers.
    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    /// Serialize back to the JSON object form.
    pub fn to_json(&self) -> serde_json::Value {
        let mut object = serde_json::Map::new();
        for (name, value) in &self.metadata {
            object.insert(name.clone(), value.clone());
        }
        for (name, info) in &self.registers {
            let mut entry = serde_json::json!({
                "base_addr": info.base_addr,
                "addr_width": info.addr_width,
                "data_width": info.data_width,
                "access": info.access,
                "sign": info.sign,
            });
            if let (Some(desc), Some(obj)) = (&info.description, entry.as_object_mut()) {
                obj.insert("description".to_string(), desc.clone().into());
            }
            object.insert(name.clone(), entry);
        }
        serde_json::Value::Object(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "circle_buf_flip": {"access": "w", "addr_width": 0, "base_addr": 327704,
                            "data_width": 2, "sign": "unsigned"},
        "shell_0_circle_data": {"access": "r", "addr_width": 13, "base_addr": 393216,
                                "data_width": 32, "sign": "signed",
                                "description": "circle buffer"},
        "plain": {"base_addr": 16},
        "__metadata__": {"git_sha": "abc"}
    }"#;

    #[test]
    fn test_parse_sample() {
        let map = RegisterMap::parse(SAMPLE).unwrap();
        assert_eq!(map.len(), 3);

        let flip = map.get("circle_buf_flip").unwrap();
        assert_eq!(flip.base_addr, 327704);
        assert_eq!(flip.word_count(), 1);
        assert_eq!(flip.mask(), 0x3);
        assert!(flip.access.writable());
        assert!(!flip.access.readable());

        let circle = map.get("shell_0_circle_data").unwrap();
        assert_eq!(circle.word_count(), 8192);
        assert_eq!(circle.sign, Sign::Signed);
        assert_eq!(circle.description.as_deref(), Some("circle buffer"));
        assert!(circle.contains(393216 + 8191));
        assert!(!circle.contains(393216 + 8192));

        let plain = map.get("plain").unwrap();
        assert_eq!(plain.access, Access::ReadWrite);
        assert_eq!(plain.mask(), u32::MAX);

        assert!(map.metadata().contains_key("__metadata__"));
    }

    #[test]
    fn test_parse_rejects_non_object() {
        assert!(matches!(
            RegisterMap::parse("[1, 2]"),
            Err(RegMapError::NotAnObject)
        ));
    }

    #[test]
    fn test_parse_rejects_missing_base_addr() {
        let err = RegisterMap::parse(r#"{"x": {"addr_width": 1}}"#).unwrap_err();
        assert!(matches!(err, RegMapError::Entry { ref name, .. } if name == "x"));
    }

    #[test]
    fn test_validate_ranges() {
        let too_wide = RegisterInfo::new("w", 0, 25);
        assert!(too_wide.validate().is_err());

        let overflow = RegisterInfo::new("o", 0x00ff_ff00, 9);
        assert!(overflow.validate().is_err());

        let bad_width = RegisterInfo::new("d", 0, 0).with_data_width(0);
        assert!(bad_width.validate().is_err());

        assert!(RegisterInfo::new("ok", 0x00ff_ff00, 8).validate().is_ok());
    }

    #[test]
    fn test_to_json_round_trip() {
        let map = RegisterMap::parse(SAMPLE).unwrap();
        let again = RegisterMap::parse(&map.to_json().to_string()).unwrap();
        assert_eq!(map, again);
    }
}
