//! On-chip EEPROM as calibration storage.

use avr_device::atmega328p::EEPROM;
use projector_core::NvStorage;

const EERE: u8 = 1 << 0;
const EEPE: u8 = 1 << 1;
const EEMPE: u8 = 1 << 2;

pub struct Eeprom<'a> {
    ee: &'a EEPROM,
}

impl<'a> Eeprom<'a> {
    pub fn new(ee: &'a EEPROM) -> Self {
        Self { ee }
    }

    fn wait_ready(&self) {
        while self.ee.eecr.read().bits() & EEPE != 0 {}
    }
}

impl NvStorage for Eeprom<'_> {
    fn read_byte(&mut self, addr: u16) -> u8 {
        self.wait_ready();
        self.ee.eear.write(|w| unsafe { w.bits(addr) });
        self.ee.eecr.write(|w| unsafe { w.bits(EERE) });
        self.ee.eedr.read().bits()
    }

    fn update_byte(&mut self, addr: u16, value: u8) {
        // Equal cells are left alone; a write costs 3.4 ms.
        if self.read_byte(addr) == value {
            return;
        }
        self.wait_ready();
        // EEPE has to follow EEMPE within four cycles.
        critical_section::with(|_| {
            self.ee.eear.write(|w| unsafe { w.bits(addr) });
            self.ee.eedr.write(|w| unsafe { w.bits(value) });
            self.ee.eecr.write(|w| unsafe { w.bits(EEMPE) });
            self.ee.eecr.write(|w| unsafe { w.bits(EEMPE | EEPE) });
        });
    }
}
