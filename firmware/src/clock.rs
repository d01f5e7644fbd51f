//! Timer1 as the free-running tick source.

use avr_device::atmega328p::{Peripherals, TC1};
use projector_core::timer::TIMER1;
use projector_core::{SplitClock, Ticks};

/// Wrap state shared between the main loop and interrupt handlers.
pub static CLOCK: SplitClock = SplitClock::new();

/// Normal mode, clock / 8: 0.5 us per tick, overflow every 32.8 ms.
pub fn init(tc1: &TC1) {
    let div8 = TIMER1.prescalers[0];
    tc1.tccr1a.write(|w| unsafe { w.bits(0) });
    tc1.tcnt1.write(|w| unsafe { w.bits(0) });
    tc1.tccr1b.write(|w| unsafe { w.bits(div8.clock_select) });
}

/// Main-context read. Must run at least once per overflow period.
pub fn now_main(tc1: &TC1) -> Ticks {
    CLOCK.now_main(tc1.tcnt1.read().bits())
}

/// Interrupt-context read.
pub fn now_interrupt(tc1: &TC1) -> Ticks {
    CLOCK.now_interrupt(tc1.tcnt1.read().bits())
}

/// Mask every timer's compare-A interrupt. INT0 and the counters keep
/// running.
pub fn disable_compare_interrupts(dp: &Peripherals) {
    const OCIEA: u8 = 1 << 1;
    critical_section::with(|_| {
        dp.TC0.timsk0.modify(|r, w| unsafe { w.bits(r.bits() & !OCIEA) });
        dp.TC1.timsk1.modify(|r, w| unsafe { w.bits(r.bits() & !OCIEA) });
        dp.TC2.timsk2.modify(|r, w| unsafe { w.bits(r.bits() & !OCIEA) });
    });
}
