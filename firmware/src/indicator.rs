//! Status LED on PB5 (Arduino D13).
//!
//! Solid while locked, dark otherwise. Each fresh lock starts a short blink
//! burst driven from the Timer2 compare interrupt; a fault blinks forever.
//! PORTB is shared with the laser lines, so every write happens with
//! interrupts off.

use core::cell::RefCell;

use avr_device::atmega328p::Peripherals;
use critical_section::Mutex;
use projector_core::clock::ticks_to_micros;
use projector_core::timer::{IntervalTimer, TIMER2};

use crate::clock;

const LED: u8 = 1 << 5;

/// Timer2 compare period.
const COMPARE_US: u32 = 16_000;
/// Compare interrupts per LED toggle, about 100 ms.
const TOGGLE_EVERY: u8 = 6;
const BURST_TOGGLES: u16 = 6;

struct Blink {
    timer: IntervalTimer,
    interval_us: u32,
    divider: u8,
    steady: bool,
}

static BLINK: Mutex<RefCell<Blink>> = Mutex::new(RefCell::new(Blink {
    timer: IntervalTimer::new(),
    interval_us: COMPARE_US,
    divider: 0,
    steady: false,
}));

pub fn init(dp: &Peripherals) {
    dp.PORTB.ddrb.modify(|r, w| unsafe { w.bits(r.bits() | LED) });

    let plan = TIMER2.plan(COMPARE_US);
    // CTC: the counter clears on the cycle after it matches OCR2A.
    dp.TC2.tccr2a.write(|w| unsafe { w.bits(0x02) });
    dp.TC2.ocr2a.write(|w| unsafe { w.bits(plan.count.saturating_sub(1) as u8) });
    dp.TC2.tccr2b.write(|w| unsafe { w.bits(plan.prescaler.clock_select) });
    dp.TC2.timsk2.write(|w| unsafe { w.bits(0x02) });

    critical_section::with(|cs| BLINK.borrow_ref_mut(cs).interval_us = plan.interval_us());
}

/// Steady level. Turning on from off starts the lock burst.
pub fn set(dp: &Peripherals, on: bool, now_us: u32) {
    critical_section::with(|cs| {
        let mut blink = BLINK.borrow_ref_mut(cs);
        if on && !blink.steady {
            arm(dp, &mut blink, BURST_TOGGLES * u16::from(TOGGLE_EVERY), now_us);
        } else if !on {
            blink.timer.disarm();
        }
        blink.steady = on;
        if !blink.timer.is_armed() {
            write_led(dp, on);
        }
    });
}

/// Blink until reset.
pub fn blink_forever(dp: &Peripherals, now_us: u32) {
    critical_section::with(|cs| {
        let mut blink = BLINK.borrow_ref_mut(cs);
        blink.steady = false;
        arm(dp, &mut blink, 0, now_us);
    });
}

fn arm(dp: &Peripherals, blink: &mut Blink, repeats: u16, now_us: u32) {
    // Line the compare phase up with the expected schedule.
    dp.TC2.tcnt2.write(|w| unsafe { w.bits(0) });
    blink.divider = 0;
    let interval_us = blink.interval_us;
    blink.timer.arm(interval_us, repeats, now_us);
}

fn write_led(dp: &Peripherals, on: bool) {
    dp.PORTB.portb.modify(|r, w| unsafe {
        if on {
            w.bits(r.bits() | LED)
        } else {
            w.bits(r.bits() & !LED)
        }
    });
}

#[avr_device::interrupt(atmega328p)]
fn TIMER2_COMPA() {
    let dp = unsafe { Peripherals::steal() };
    let now_us = ticks_to_micros(clock::now_interrupt(&dp.TC1));

    critical_section::with(|cs| {
        let mut blink = BLINK.borrow_ref_mut(cs);
        if !blink.timer.on_compare(now_us) {
            return;
        }
        if !blink.timer.is_armed() {
            let steady = blink.steady;
            write_led(&dp, steady);
            return;
        }

        blink.divider += 1;
        if blink.divider >= TOGGLE_EVERY {
            blink.divider = 0;
            // Writing a one to PINB toggles the pin.
            dp.PORTB.pinb.write(|w| unsafe { w.bits(LED) });
        }
    });
}
