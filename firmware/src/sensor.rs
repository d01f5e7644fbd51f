//! Revolution sensor on PD2 / INT0.

use avr_device::atmega328p::Peripherals;
use projector_core::{SyncCapture, Ticks};

use crate::clock;

const SENSOR: u8 = 1 << 2;

/// ISC01 | ISC00: interrupt on the rising edge.
const RISING_EDGE: u8 = 0b11;

pub static SYNC: SyncCapture = SyncCapture::new(0);

pub fn init(dp: &Peripherals, debounce: Ticks) {
    SYNC.set_debounce(debounce);

    // Input with pull-up; the sensor output is open collector.
    dp.PORTD.ddrd.modify(|r, w| unsafe { w.bits(r.bits() & !SENSOR) });
    dp.PORTD.portd.modify(|r, w| unsafe { w.bits(r.bits() | SENSOR) });

    dp.EXINT.eicra.modify(|r, w| unsafe { w.bits((r.bits() & !0b11) | RISING_EDGE) });
    dp.EXINT.eifr.write(|w| unsafe { w.bits(0x01) });
    dp.EXINT.eimsk.modify(|r, w| unsafe { w.bits(r.bits() | 0x01) });
}

#[avr_device::interrupt(atmega328p)]
fn INT0() {
    let dp = unsafe { Peripherals::steal() };
    let now = clock::now_interrupt(&dp.TC1);
    critical_section::with(|cs| {
        SYNC.on_edge(cs, now);
    });
}
