//! Extended-width clock built on a 16-bit free-running counter.
//!
//! The counter wraps every 65536 ticks (32.8 ms at 0.5 µs per tick). The
//! wrap count lives in two snapshot buffers selected by a one-byte flag.
//! The main context copies the selected snapshot into the other buffer,
//! updates that copy, then flips the flag. The interrupt context only ever
//! reads the buffer the flag selects, so neither side can see a wrap that
//! was counted twice or not at all.
//!
//! `now_main` must run at least once per counter period, otherwise a wrap
//! goes unnoticed.

use core::cell::Cell;

/// Hardware clock ticks (0.5 µs each). Wraps after about 35 minutes, so all
/// comparisons go through [`ticks_until`].
pub type Ticks = u32;

/// Timer1 runs at F_CPU / 8 = 2 MHz.
pub const TICKS_PER_MICROSECOND: u32 = 2;

/// Signed distance from `now` to `target`. Zero or negative means the
/// target instant has already passed.
#[inline]
pub fn ticks_until(target: Ticks, now: Ticks) -> i32 {
    target.wrapping_sub(now) as i32
}

#[inline]
pub const fn ticks_to_micros(ticks: Ticks) -> u32 {
    ticks / TICKS_PER_MICROSECOND
}

#[inline]
pub const fn micros_to_ticks(micros: u32) -> Ticks {
    micros.wrapping_mul(TICKS_PER_MICROSECOND)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Snapshot {
    /// Counter value seen by the last main-context read.
    prev_low: u16,
    /// Number of counter wraps observed so far.
    high: u16,
}

impl Snapshot {
    const ZERO: Self = Self {
        prev_low: 0,
        high: 0,
    };

    fn high_at(self, low: u16) -> u16 {
        if self.prev_low > low {
            self.high.wrapping_add(1)
        } else {
            self.high
        }
    }
}

/// Double-buffered wrap tracker for a 16-bit counter.
///
/// The counter value itself is passed in by the caller, which keeps this
/// type free of register access and lets the firmware decide how to read
/// TCNT1.
pub struct SplitClock {
    snapshots: [Cell<Snapshot>; 2],
    active: Cell<u8>,
}

// SAFETY: the projector runs on a single core. The main context only writes
// the snapshot the flag does not select, and the flag flip happens inside a
// critical section. The interrupt context never writes.
unsafe impl Sync for SplitClock {}

impl SplitClock {
    pub const fn new() -> Self {
        Self {
            snapshots: [Cell::new(Snapshot::ZERO), Cell::new(Snapshot::ZERO)],
            active: Cell::new(0),
        }
    }

    /// Extend `low` to a full tick value from the main context.
    ///
    /// Publishes the updated wrap state for the interrupt context.
    pub fn now_main(&self, low: u16) -> Ticks {
        let active = usize::from(self.active.get() & 1);
        let idle = active ^ 1;

        let previous = self.snapshots[active].get();
        let updated = Snapshot {
            prev_low: low,
            high: previous.high_at(low),
        };
        self.snapshots[idle].set(updated);

        critical_section::with(|_| self.active.set(idle as u8));

        compose(updated.high, low)
    }

    /// Extend `low` to a full tick value from the interrupt context.
    ///
    /// Read-only: the flag is left alone, so the main context stays the only
    /// writer of wrap state.
    pub fn now_interrupt(&self, low: u16) -> Ticks {
        let snapshot = self.snapshots[usize::from(self.active.get() & 1)].get();
        compose(snapshot.high_at(low), low)
    }
}

impl Default for SplitClock {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn compose(high: u16, low: u16) -> Ticks {
    (Ticks::from(high) << 16) | Ticks::from(low)
}
