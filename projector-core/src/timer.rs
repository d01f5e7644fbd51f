//! Compare-match planning for the ATmega328P timers.
//!
//! A requested interval is turned into the lowest prescaler whose compare
//! count still fits the counter, which keeps resolution as fine as
//! possible. Requests longer than the timer can express are clamped to
//! its longest interval; a slow blink beats a stalled control loop.

use log::warn;

/// 16 MHz system clock.
pub const CYCLES_PER_MICROSECOND: u32 = 16;

/// A compare interrupt further than this from where it was expected is
/// treated as spurious and skipped.
pub const SPURIOUS_WINDOW_US: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prescaler {
    /// Division factor is `1 << shift`.
    pub shift: u8,
    /// CSn2..CSn0 bits for TCCRnB.
    pub clock_select: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct TimerInfo {
    pub prescalers: &'static [Prescaler],
    pub max_count: u16,
}

const PRESCALERS_TIMER0: [Prescaler; 4] = [
    Prescaler { shift: 3, clock_select: 0b010 },  // 8
    Prescaler { shift: 6, clock_select: 0b011 },  // 64
    Prescaler { shift: 8, clock_select: 0b100 },  // 256
    Prescaler { shift: 10, clock_select: 0b101 }, // 1024
];

// Timer2 has its own, finer prescaler ladder.
const PRESCALERS_TIMER2: [Prescaler; 6] = [
    Prescaler { shift: 3, clock_select: 0b010 },  // 8
    Prescaler { shift: 5, clock_select: 0b011 },  // 32
    Prescaler { shift: 6, clock_select: 0b100 },  // 64
    Prescaler { shift: 7, clock_select: 0b101 },  // 128
    Prescaler { shift: 8, clock_select: 0b110 },  // 256
    Prescaler { shift: 10, clock_select: 0b111 }, // 1024
];

pub const TIMER0: TimerInfo = TimerInfo {
    prescalers: &PRESCALERS_TIMER0,
    max_count: 0xFF,
};

/// Timer1 shares Timer0's ladder but counts to 16 bits.
pub const TIMER1: TimerInfo = TimerInfo {
    prescalers: &PRESCALERS_TIMER0,
    max_count: 0xFFFF,
};

pub const TIMER2: TimerInfo = TimerInfo {
    prescalers: &PRESCALERS_TIMER2,
    max_count: 0xFF,
};

/// Register values for one compare-match interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompareMatch {
    pub prescaler: Prescaler,
    pub count: u16,
    /// The request did not fit and was cut to the longest interval.
    pub clamped: bool,
}

impl CompareMatch {
    /// Interval this plan actually produces.
    pub fn interval_us(&self) -> u32 {
        (u32::from(self.count) << self.prescaler.shift) / CYCLES_PER_MICROSECOND
    }
}

impl TimerInfo {
    pub fn plan(&self, interval_us: u32) -> CompareMatch {
        let cycles = interval_us.saturating_mul(CYCLES_PER_MICROSECOND);
        for &prescaler in self.prescalers {
            let count = cycles >> prescaler.shift;
            if count <= u32::from(self.max_count) {
                return CompareMatch {
                    prescaler,
                    count: count as u16,
                    clamped: false,
                };
            }
        }

        let slowest = self.prescalers[self.prescalers.len() - 1];
        let plan = CompareMatch {
            prescaler: slowest,
            count: self.max_count,
            clamped: true,
        };
        warn!(
            "timer interval {} us out of range, clamped to {} us",
            interval_us,
            plan.interval_us()
        );
        plan
    }
}

/// Bookkeeping for a handler driven by a compare interrupt.
///
/// Armed with an interval and a repeat count (0 repeats forever). The
/// interrupt calls [`IntervalTimer::on_compare`] and runs its handler when
/// that returns true.
#[derive(Debug, Clone)]
pub struct IntervalTimer {
    interval_us: u32,
    remaining: u16,
    forever: bool,
    armed: bool,
    expected_us: u32,
}

impl IntervalTimer {
    pub const fn new() -> Self {
        Self {
            interval_us: 0,
            remaining: 0,
            forever: false,
            armed: false,
            expected_us: 0,
        }
    }

    pub fn arm(&mut self, interval_us: u32, repeats: u16, now_us: u32) {
        self.interval_us = interval_us;
        self.remaining = repeats;
        self.forever = repeats == 0;
        self.armed = true;
        self.expected_us = now_us.wrapping_add(interval_us);
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn on_compare(&mut self, now_us: u32) -> bool {
        let drift = now_us.wrapping_sub(self.expected_us) as i32;
        if drift.unsigned_abs() > SPURIOUS_WINDOW_US {
            return false;
        }
        self.expected_us = now_us.wrapping_add(self.interval_us);

        if !self.armed {
            return false;
        }
        if !self.forever {
            self.remaining = self.remaining.saturating_sub(1);
            if self.remaining == 0 {
                self.armed = false;
            }
        }
        true
    }
}

impl Default for IntervalTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_finest_prescaler_that_fits() {
        // 100 us = 1600 cycles; /8 gives 200, fits 8 bits.
        let plan = TIMER0.plan(100);
        assert_eq!(plan.prescaler.shift, 3);
        assert_eq!(plan.count, 200);
        assert!(!plan.clamped);

        // 1 ms = 16000 cycles; /64 gives 250.
        let plan = TIMER0.plan(1_000);
        assert_eq!(plan.prescaler.shift, 6);
        assert_eq!(plan.count, 250);
    }

    #[test]
    fn sixteen_bit_timer_stays_on_fine_prescaler() {
        let plan = TIMER1.plan(20_000);
        assert_eq!(plan.prescaler.shift, 3);
        assert_eq!(plan.count, 40_000);
    }

    #[test]
    fn timer2_uses_its_own_ladder() {
        // 400 us = 6400 cycles; /32 gives 200.
        let plan = TIMER2.plan(400);
        assert_eq!(plan.prescaler, Prescaler { shift: 5, clock_select: 0b011 });
        assert_eq!(plan.count, 200);
    }

    #[test]
    fn out_of_range_requests_are_clamped() {
        let plan = TIMER0.plan(1_000_000);
        assert!(plan.clamped);
        assert_eq!(plan.prescaler.shift, 10);
        assert_eq!(plan.count, 0xFF);
        assert_eq!(plan.interval_us(), 16_320);
    }

    #[test]
    fn finite_repeat_count_disarms() {
        let mut timer = IntervalTimer::new();
        timer.arm(10_000, 2, 0);
        assert!(timer.on_compare(10_000));
        assert!(timer.on_compare(20_010));
        assert!(!timer.is_armed());
        assert!(!timer.on_compare(30_010));
    }

    #[test]
    fn zero_repeats_runs_forever() {
        let mut timer = IntervalTimer::new();
        timer.arm(1_000, 0, 0);
        for k in 1..=50 {
            assert!(timer.on_compare(k * 1_000));
        }
        assert!(timer.is_armed());
    }

    #[test]
    fn early_interrupt_is_ignored() {
        let mut timer = IntervalTimer::new();
        timer.arm(10_000, 0, 0);
        assert!(!timer.on_compare(4_000));
        // The schedule is unchanged by the spurious one.
        assert!(timer.on_compare(10_050));
    }
}
