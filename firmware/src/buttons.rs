//! Calibration push-buttons on PD4..PD6, active low with pull-ups.

use avr_device::atmega328p::PORTD;
use projector_core::clock::micros_to_ticks;
use projector_core::{ButtonLevels, Ticks};

const LEFT: u8 = 1 << 4;
const RIGHT: u8 = 1 << 5;
const SELECT: u8 = 1 << 6;
const ALL: u8 = LEFT | RIGHT | SELECT;

/// A contact must read the same for 10 ms before it counts.
pub const SETTLE: Ticks = micros_to_ticks(10_000);

pub fn init(portd: &PORTD) {
    portd.ddrd.modify(|r, w| unsafe { w.bits(r.bits() & !ALL) });
    portd.portd.modify(|r, w| unsafe { w.bits(r.bits() | ALL) });
}

/// Raw levels, true while pressed.
pub fn read(portd: &PORTD) -> ButtonLevels {
    let pressed = !portd.pind.read().bits();
    ButtonLevels {
        left: pressed & LEFT != 0,
        right: pressed & RIGHT != 0,
        select: pressed & SELECT != 0,
    }
}
