//! Initial register values file.
//!
//! One `address value` pair per line, both hexadecimal (an optional `0x`
//! prefix is accepted). Blank lines are skipped; zero values are dropped
//! since the image starts zeroed.
//!
//! ```text
//! 10 0000abcd
//! 0x20 1
//! ```

use crate::error::{SimError, SimResult};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Parsed initial values, ordered by address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitialValues {
    values: BTreeMap<u32, u32>,
}

impl InitialValues {
    /// Parse the text of an initial values file.
    ///
    /// # Errors
    /// `SimError::InitialValues` naming the first malformed line (1-based).
    pub fn parse(text: &str) -> SimResult<Self> {
        let mut values = BTreeMap::new();
        for (n, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let bad = || SimError::InitialValues {
                line: n + 1,
                content: line.to_string(),
            };
            let mut fields = line.split_whitespace();
            let (Some(addr), Some(value), None) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(bad());
            };
            let addr = parse_hex(addr).ok_or_else(bad)?;
            let value = parse_hex(value).ok_or_else(bad)?;
            if value != 0 {
                debug!("Initialize {:x} with {:x}", addr, value);
                values.insert(addr, value);
            }
        }
        Ok(Self { values })
    }

    /// Read and parse a file.
    pub fn load(path: &Path) -> SimResult<Self> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// `(address, value)` pairs in address order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.values.iter().map(|(&a, &v)| (a, v))
    }

    /// Number of non-zero values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if no values were given.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn parse_hex(field: &str) -> Option<u32> {
    let digits = field
        .strip_prefix("0x")
        .or_else(|| field.strip_prefix("0X"))
        .unwrap_or(field);
    u32::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_skips_blank_and_zero() {
        let values = InitialValues::parse("\n10 abcd\n  \n0x20 0\n0X30\t1\r\n").unwrap();
        assert_eq!(values.iter().collect::<Vec<_>>(), vec![(0x10, 0xabcd), (0x30, 1)]);
    }

    #[test]
    fn test_parse_reports_line() {
        let err = InitialValues::parse("10 1\n\n20 zz\n").unwrap_err();
        assert!(matches!(err, SimError::InitialValues { line: 3, .. }));

        let err = InitialValues::parse("10 1 2\n").unwrap_err();
        assert!(matches!(err, SimError::InitialValues { line: 1, .. }));

        let err = InitialValues::parse("10\n").unwrap_err();
        assert!(matches!(err, SimError::InitialValues { line: 1, .. }));
    }

    #[test]
    fn test_load_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "800 ffff").unwrap();
        writeln!(file, "4 deadbeef").unwrap();
        let values = InitialValues::load(file.path()).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values.iter().next(), Some((4, 0xdead_beef)));
    }
}
