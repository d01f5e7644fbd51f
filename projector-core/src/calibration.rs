//! Per-facet horizontal trim, persisted in non-volatile memory.
//!
//! Drum facets are never ground perfectly evenly, so each facet's scan
//! start gets a signed tick offset that slides its line left or right.
//!
//! Storage layout, little-endian:
//!
//! ```text
//! 0x0000  u16  format version
//! 0x0002  i16  offset for facet 0
//! 0x0004  i16  offset for facet 1
//! ...
//! ```

use heapless::Vec;
use log::{info, warn};

use crate::input::ButtonEdges;
use crate::MAX_FACETS;

/// Bump when the stored layout changes; older tables are then discarded.
pub const CALIBRATION_VERSION: u16 = 3;

const VERSION_ADDR: u16 = 0;
const OFFSETS_ADDR: u16 = 2;

/// Byte-addressable non-volatile memory.
pub trait NvStorage {
    fn read_byte(&mut self, addr: u16) -> u8;

    /// Write `value` unless the cell already holds it.
    fn update_byte(&mut self, addr: u16, value: u8);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationTable {
    offsets: Vec<i16, MAX_FACETS>,
    needs_write: bool,
}

impl CalibrationTable {
    pub fn defaults(facets: usize, default_offset: i16) -> Self {
        let mut offsets = Vec::new();
        for _ in 0..facets.min(MAX_FACETS) {
            let _ = offsets.push(default_offset);
        }
        Self {
            offsets,
            needs_write: false,
        }
    }

    /// Read the table, or fall back to defaults when the stored version
    /// does not match. A fallback table is flagged for rewrite.
    pub fn load<S: NvStorage + ?Sized>(storage: &mut S, facets: usize, default_offset: i16) -> Self {
        let version = read_u16(storage, VERSION_ADDR);
        if version != CALIBRATION_VERSION {
            warn!(
                "calibration version {} != {}, using defaults",
                version, CALIBRATION_VERSION
            );
            let mut table = Self::defaults(facets, default_offset);
            table.needs_write = true;
            return table;
        }

        let mut offsets = Vec::new();
        for facet in 0..facets.min(MAX_FACETS) {
            let addr = OFFSETS_ADDR + 2 * facet as u16;
            let _ = offsets.push(read_u16(storage, addr) as i16);
        }
        info!("calibration loaded for {} facets", offsets.len());
        Self {
            offsets,
            needs_write: false,
        }
    }

    /// Write version tag and every offset.
    pub fn store<S: NvStorage + ?Sized>(&mut self, storage: &mut S) {
        write_u16(storage, VERSION_ADDR, CALIBRATION_VERSION);
        for (facet, &offset) in self.offsets.iter().enumerate() {
            write_u16(storage, OFFSETS_ADDR + 2 * facet as u16, offset as u16);
        }
        self.needs_write = false;
    }

    pub fn needs_write(&self) -> bool {
        self.needs_write
    }

    pub fn offset(&self, facet: usize) -> i16 {
        self.offsets.get(facet).copied().unwrap_or(0)
    }

    pub fn offsets(&self) -> &[i16] {
        &self.offsets
    }

    pub fn facets(&self) -> usize {
        self.offsets.len()
    }

    pub fn set_offset(&mut self, facet: usize, offset: i16) {
        if let Some(slot) = self.offsets.get_mut(facet) {
            *slot = offset;
        }
    }

    pub fn adjust(&mut self, facet: usize, delta: i16) -> i16 {
        let offset = self.offset(facet).saturating_add(delta);
        self.set_offset(facet, offset);
        offset
    }

    /// Bytes the table occupies in storage.
    pub fn storage_len(facets: usize) -> usize {
        OFFSETS_ADDR as usize + 2 * facets
    }
}

fn read_u16<S: NvStorage + ?Sized>(storage: &mut S, addr: u16) -> u16 {
    u16::from_le_bytes([storage.read_byte(addr), storage.read_byte(addr + 1)])
}

fn write_u16<S: NvStorage + ?Sized>(storage: &mut S, addr: u16, value: u16) {
    let [lo, hi] = value.to_le_bytes();
    storage.update_byte(addr, lo);
    storage.update_byte(addr + 1, hi);
}

/// Storage that services the main-context clock after every byte.
///
/// An EEPROM cell takes milliseconds to program, so saving a whole table
/// can outlast a counter period. `service` reads the clock between cells
/// to keep its wrap count current.
pub struct ClockedStorage<S, F> {
    storage: S,
    service: F,
}

impl<S: NvStorage, F: FnMut()> ClockedStorage<S, F> {
    pub fn new(storage: S, service: F) -> Self {
        Self { storage, service }
    }
}

impl<S: NvStorage, F: FnMut()> NvStorage for ClockedStorage<S, F> {
    fn read_byte(&mut self, addr: u16) -> u8 {
        self.storage.read_byte(addr)
    }

    fn update_byte(&mut self, addr: u16, value: u8) {
        self.storage.update_byte(addr, value);
        (self.service)();
    }
}

/// What a calibration button press did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationAction {
    None,
    Adjusted { facet: usize, offset: i16 },
    Selected { facet: usize },
    /// Cursor wrapped to facet 0 and the table was written back.
    Saved,
}

/// Interactive trim: left/right nudge the selected facet, select moves
/// to the next one. Wrapping past the last facet saves the table.
#[derive(Debug, Clone)]
pub struct Calibrator {
    cursor: usize,
    step: i16,
}

impl Calibrator {
    pub fn new(step: i16) -> Self {
        Self { cursor: 0, step }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn apply<S: NvStorage + ?Sized>(
        &mut self,
        edges: ButtonEdges,
        table: &mut CalibrationTable,
        storage: &mut S,
    ) -> CalibrationAction {
        let mut action = CalibrationAction::None;

        let presses = i16::from(edges.right) - i16::from(edges.left);
        if presses != 0 {
            let offset = table.adjust(self.cursor, presses * self.step);
            info!("facet {} offset {}", self.cursor, offset);
            action = CalibrationAction::Adjusted {
                facet: self.cursor,
                offset,
            };
        }

        if edges.select {
            let facets = table.facets().max(1);
            self.cursor = (self.cursor + 1) % facets;
            if self.cursor == 0 {
                table.store(storage);
                info!("calibration saved");
                action = CalibrationAction::Saved;
            } else {
                info!("calibrating facet {}", self.cursor);
                action = CalibrationAction::Selected { facet: self.cursor };
            }
        }

        action
    }
}
