//! Laser lines and the glue that hands the engine its hardware.

use avr_device::atmega328p::Peripherals;
use projector_core::clock::ticks_to_micros;
use projector_core::{LaserDriver, RevolutionEvent, ScanIo, Ticks};

use crate::{clock, indicator, sensor};

/// Plane 0 on PB0 (D8), plane 1 on PB1 (D9).
const LASERS: u8 = 0x03;

pub fn init(dp: &Peripherals) {
    lasers_off(dp);
    dp.PORTB.ddrb.modify(|r, w| unsafe { w.bits(r.bits() | LASERS) });
}

pub fn lasers_off(dp: &Peripherals) {
    dp.PORTB.portb.modify(|r, w| unsafe { w.bits(r.bits() & !LASERS) });
}

pub struct Board<'a> {
    dp: &'a Peripherals,
}

impl<'a> Board<'a> {
    pub fn new(dp: &'a Peripherals) -> Self {
        Self { dp }
    }
}

impl LaserDriver for Board<'_> {
    #[inline(always)]
    fn set_lasers(&mut self, levels: u8) {
        // The indicator ISR toggles PB5 on the same port.
        critical_section::with(|_| {
            self.dp.PORTB.portb.modify(|r, w| unsafe {
                w.bits((r.bits() & !LASERS) | (levels & LASERS))
            });
        });
    }

    #[inline(always)]
    fn hold(&mut self, count: u16) {
        for _ in 0..count {
            unsafe { core::arch::asm!("nop") };
        }
    }
}

impl ScanIo for Board<'_> {
    fn now(&mut self) -> Ticks {
        clock::now_main(&self.dp.TC1)
    }

    fn take_revolution(&mut self) -> Option<RevolutionEvent> {
        sensor::SYNC.take()
    }

    fn set_indicator(&mut self, on: bool) {
        let now_us = ticks_to_micros(self.now());
        indicator::set(self.dp, on, now_us);
    }
}
