//! Simulated register image.
//!
//! Mirrors the memory layout a real device exposes: every register of the
//! JSON map, the greeting register at address 0 and the ROM holding the
//! map itself.

use crate::error::{SimError, SimResult};
use crate::initial::InitialValues;
use leep_common::consts::{
    HELLO_ADDRESS, HELLO_WORDS, ROM_2K_ADDRESS, ROM_2K_WORDS, ROM_16K_ADDRESS, ROM_16K_WORDS,
};
use leep_common::regmap::{RegisterInfo, RegisterMap};
use leep_common::rom::{Rom, RomDescriptor};
use std::collections::HashMap;
use tracing::{info, warn};

/// Name of the register holding the ROM image.
pub const ROM_REGISTER: &str = "ROM";

/// Name of the greeting register.
pub const HELLO_REGISTER: &str = "Hello";

/// Name of the zeroed small ROM kept in big-ROM mode.
pub const OLD_ROM_REGISTER: &str = "oldRom";

/// Description text placed in the simulator ROM.
pub const ROM_DESCRIPTION: &str = "LEEP Simulator";

const ZERO_HASH: &str = "0000000000000000000000000000000000000000";

/// One register of the simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimRegister {
    /// Register name.
    pub name: String,
    /// First word address.
    pub base: u32,
    /// Mask applied to written values.
    pub mask: u32,
    /// Reads allowed (only logged when violated).
    pub readable: bool,
    /// Writes allowed (only logged when violated).
    pub writable: bool,
    /// Register words.
    pub storage: Vec<u32>,
}

impl SimRegister {
    /// Read/write register of `words` words.
    pub fn new(name: impl Into<String>, base: u32, words: usize, mask: u32) -> Self {
        Self {
            name: name.into(),
            base,
            mask,
            readable: true,
            writable: true,
            storage: vec![0; words],
        }
    }

    /// Register described by a register map entry.
    pub fn from_info(info: &RegisterInfo) -> Self {
        Self {
            name: info.name.clone(),
            base: info.base_addr,
            mask: info.mask(),
            readable: info.access.readable(),
            writable: info.access.writable(),
            storage: vec![0; info.word_count()],
        }
    }

    /// Builder: make the register read-only.
    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    /// Test a bit of the first word.
    pub fn bit(&self, bit: u32) -> bool {
        self.storage.first().is_some_and(|w| w & (1 << bit) != 0)
    }
}

/// The full register image.
#[derive(Debug, Default)]
pub struct SimImage {
    registers: Vec<SimRegister>,
    by_name: HashMap<String, usize>,
    by_addr: HashMap<u32, usize>,
}

impl SimImage {
    /// Empty image.
    pub fn new() -> Self {
        Self::default()
    }

    /// Image for a JSON register map, with greeting and ROM registers and
    /// the ROM filled with the map.
    pub fn from_json(json: &str, big_rom: bool) -> SimResult<Self> {
        let map = RegisterMap::parse(json)?;
        let mut image = Self::from_register_map(&map, big_rom)?;
        let rom = Rom::new()
            .with(RomDescriptor::Text(ROM_DESCRIPTION.to_string()))
            .with(RomDescriptor::BigInt(ZERO_HASH.to_string()))
            .with(RomDescriptor::BigInt(ZERO_HASH.to_string()))
            .with(RomDescriptor::Json(json.to_string()));
        image.load_rom(&rom)?;
        Ok(image)
    }

    /// Image for a register map plus greeting and (empty) ROM registers.
    pub fn from_register_map(map: &RegisterMap, big_rom: bool) -> SimResult<Self> {
        let mut image = Self::new();
        for info in map.iter() {
            image.add(SimRegister::from_info(info))?;
        }

        let mut hello = SimRegister::new(HELLO_REGISTER, HELLO_ADDRESS, HELLO_WORDS.len(), u32::MAX);
        hello.storage.copy_from_slice(&HELLO_WORDS);
        image.add(hello.read_only())?;

        if big_rom {
            image.add(SimRegister::new(OLD_ROM_REGISTER, ROM_2K_ADDRESS, ROM_2K_WORDS, 0xffff).read_only())?;
            image.add(SimRegister::new(ROM_REGISTER, ROM_16K_ADDRESS, ROM_16K_WORDS, 0xffff).read_only())?;
        } else {
            image.add(SimRegister::new(ROM_REGISTER, ROM_2K_ADDRESS, ROM_2K_WORDS, 0xffff).read_only())?;
        }
        Ok(image)
    }

    /// Add a register. Overlapping addresses are reported and taken over
    /// by the newer register.
    pub fn add(&mut self, register: SimRegister) -> SimResult<usize> {
        if self.by_name.contains_key(&register.name) {
            return Err(SimError::DuplicateRegister(register.name));
        }
        let index = self.registers.len();
        for offset in 0..register.storage.len() as u32 {
            let addr = register.base + offset;
            if let Some(prev) = self.by_addr.insert(addr, index) {
                warn!(
                    "Overlapping registers at address {:#x}: {} and {}",
                    addr, self.registers[prev].name, register.name
                );
            }
        }
        self.by_name.insert(register.name.clone(), index);
        self.registers.push(register);
        Ok(index)
    }

    /// Index of a register by name.
    pub fn index(&self, name: &str) -> SimResult<usize> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| SimError::UnknownRegister(name.to_string()))
    }

    /// Register by name.
    pub fn get(&self, name: &str) -> Option<&SimRegister> {
        self.by_name.get(name).map(|&i| &self.registers[i])
    }

    /// Mutable register by name.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut SimRegister> {
        self.by_name.get(name).map(|&i| &mut self.registers[i])
    }

    /// Register by index.
    pub fn reg(&self, index: usize) -> &SimRegister {
        &self.registers[index]
    }

    /// Mutable register by index.
    pub fn reg_mut(&mut self, index: usize) -> &mut SimRegister {
        &mut self.registers[index]
    }

    /// Register index and word offset for an address.
    pub fn locate(&self, address: u32) -> Option<(usize, usize)> {
        let index = *self.by_addr.get(&address)?;
        Some((index, (address - self.registers[index].base) as usize))
    }

    /// Store a word, applying the register mask.
    pub fn store(&mut self, index: usize, offset: usize, value: u32) {
        let reg = &mut self.registers[index];
        reg.storage[offset] = value & reg.mask;
    }

    /// Registers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &SimRegister> {
        self.registers.iter()
    }

    /// Write a ROM image into the ROM register.
    pub fn load_rom(&mut self, rom: &Rom) -> SimResult<()> {
        let reg = self
            .get_mut(ROM_REGISTER)
            .ok_or_else(|| SimError::UnknownRegister(ROM_REGISTER.to_string()))?;
        reg.storage = rom.encode(reg.storage.len())?;
        let used = reg.storage.iter().rposition(|&w| w != 0).map_or(0, |p| p + 1);
        info!("ROM contents {}/{}", used, reg.storage.len());
        Ok(())
    }

    /// Apply initial values; returns how many were applied.
    ///
    /// Values for unmapped addresses or for the ROM are skipped.
    pub fn apply_initial(&mut self, values: &InitialValues) -> usize {
        let rom = self.by_name.get(ROM_REGISTER).copied();
        let mut applied = 0;
        for (address, value) in values.iter() {
            match self.locate(address) {
                None => info!("Can't initialize non-existent register {:#x}", address),
                Some((index, _)) if Some(index) == rom => {}
                Some((index, offset)) => {
                    self.registers[index].storage[offset] = value;
                    applied += 1;
                }
            }
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAP: &str = r#"{
        "scratch": {"base_addr": 16, "addr_width": 2, "data_width": 12, "access": "rw"},
        "status": {"base_addr": 32, "access": "r"}
    }"#;

    #[test]
    fn test_from_json_layout() {
        let image = SimImage::from_json(MAP, false).unwrap();
        assert_eq!(image.get(HELLO_REGISTER).unwrap().storage, HELLO_WORDS.to_vec());
        assert_eq!(image.locate(0x800), Some((image.index(ROM_REGISTER).unwrap(), 0)));
        assert_eq!(image.locate(19).map(|(_, o)| o), Some(3));
        assert_eq!(image.locate(20), None);

        let rom = Rom::parse(&image.get(ROM_REGISTER).unwrap().storage).unwrap();
        assert_eq!(rom.description(), Some(ROM_DESCRIPTION));
        assert_eq!(rom.json(), Some(MAP));
    }

    #[test]
    fn test_big_rom_layout() {
        let image = SimImage::from_json(MAP, true).unwrap();
        let old = image.get(OLD_ROM_REGISTER).unwrap();
        assert_eq!(old.base, ROM_2K_ADDRESS);
        assert!(old.storage.iter().all(|&w| w == 0));
        assert_eq!(image.get(ROM_REGISTER).unwrap().base, ROM_16K_ADDRESS);
        assert!(Rom::parse(&image.get(ROM_REGISTER).unwrap().storage).is_ok());
    }

    #[test]
    fn test_store_applies_mask() {
        let mut image = SimImage::from_json(MAP, false).unwrap();
        let idx = image.index("scratch").unwrap();
        image.store(idx, 1, 0xffff_ffff);
        assert_eq!(image.reg(idx).storage[1], 0xfff);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut image = SimImage::new();
        image.add(SimRegister::new("a", 0, 1, u32::MAX)).unwrap();
        assert!(matches!(
            image.add(SimRegister::new("a", 8, 1, u32::MAX)),
            Err(SimError::DuplicateRegister(_))
        ));
    }

    #[test]
    fn test_overlap_newer_wins() {
        let mut image = SimImage::new();
        image.add(SimRegister::new("a", 0, 4, u32::MAX)).unwrap();
        let b = image.add(SimRegister::new("b", 2, 4, u32::MAX)).unwrap();
        assert_eq!(image.locate(3), Some((b, 1)));
    }

    #[test]
    fn test_apply_initial_skips_rom_and_unmapped() {
        let mut image = SimImage::from_json(MAP, false).unwrap();
        let rom_before = image.get(ROM_REGISTER).unwrap().storage[0];
        let values = InitialValues::parse("10 5\n800 1234\nfff0 9\n").unwrap();
        assert_eq!(image.apply_initial(&values), 1);
        assert_eq!(image.get("scratch").unwrap().storage[0], 5);
        assert_eq!(image.get(ROM_REGISTER).unwrap().storage[0], rom_before);
    }
}
