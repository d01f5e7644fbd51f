//! Host-side EEPROM image.

use anyhow::{bail, Result};
use projector_core::NvStorage;

/// ATmega328P EEPROM size.
pub const EEPROM_SIZE: usize = 1024;

#[derive(Debug, Clone)]
pub struct EepromImage {
    bytes: Vec<u8>,
    writes: usize,
}

impl EepromImage {
    pub fn erased() -> Self {
        Self {
            bytes: vec![0xFF; EEPROM_SIZE],
            writes: 0,
        }
    }

    /// Place `data` at `base` over an erased image.
    pub fn from_bytes(base: u32, data: &[u8]) -> Result<Self> {
        let end = base as usize + data.len();
        if end > EEPROM_SIZE {
            bail!(
                "image ends at 0x{:04X}, past the {} byte EEPROM",
                end,
                EEPROM_SIZE
            );
        }
        let mut image = Self::erased();
        image.bytes[base as usize..end].copy_from_slice(data);
        Ok(image)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Cells actually changed by `update_byte`.
    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl NvStorage for EepromImage {
    fn read_byte(&mut self, addr: u16) -> u8 {
        self.bytes.get(usize::from(addr)).copied().unwrap_or(0xFF)
    }

    fn update_byte(&mut self, addr: u16, value: u8) {
        if let Some(cell) = self.bytes.get_mut(usize::from(addr)) {
            if *cell != value {
                *cell = value;
                self.writes += 1;
            }
        }
    }
}
