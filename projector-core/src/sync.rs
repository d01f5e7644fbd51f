//! Lock/unlock hysteresis for the drum rotation.
//!
//! Lock needs `lock_count` steady revolutions in a row. Once locked, only
//! `unlock_count` unsteady revolutions in a row drop it again, so a single
//! noisy sample neither grants nor removes lock. Before lock there is no
//! partial credit: one bad sample sends progress back to zero.

use crate::clock::Ticks;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Unsynchronized,
    Synchronized,
}

#[derive(Clone, Debug)]
pub struct SyncTracker {
    lock_count: u8,
    unlock_count: u8,
    tolerance: Ticks,
    in_tolerance: u8,
    out_of_tolerance: u8,
    /// Duration new samples are compared against.
    reference: Option<Ticks>,
}

impl SyncTracker {
    pub fn new(lock_count: u8, unlock_count: u8, tolerance: Ticks) -> Self {
        Self {
            lock_count,
            unlock_count,
            tolerance,
            in_tolerance: 0,
            out_of_tolerance: 0,
            reference: None,
        }
    }

    pub fn state(&self) -> SyncState {
        if self.in_tolerance == self.lock_count {
            SyncState::Synchronized
        } else {
            SyncState::Unsynchronized
        }
    }

    pub fn is_synchronized(&self) -> bool {
        self.state() == SyncState::Synchronized
    }

    pub fn in_tolerance_count(&self) -> u8 {
        self.in_tolerance
    }

    pub fn out_of_tolerance_count(&self) -> u8 {
        self.out_of_tolerance
    }

    /// Classify a measured revolution and feed it through the hysteresis.
    ///
    /// The first sample only seeds the reference and counts as steady.
    /// While locked, unsteady samples leave the reference alone so that a
    /// run of them is compared against the locked speed, not each other.
    pub fn observe(&mut self, duration: Ticks) -> SyncState {
        let steady = match self.reference {
            Some(reference) => duration.abs_diff(reference) < self.tolerance,
            None => true,
        };

        if steady {
            self.reference = Some(duration);
            self.record_in_tolerance()
        } else {
            let state = self.record_out_of_tolerance();
            if state == SyncState::Unsynchronized {
                self.reference = Some(duration);
            }
            state
        }
    }

    pub fn record_in_tolerance(&mut self) -> SyncState {
        if self.in_tolerance < self.lock_count {
            self.in_tolerance += 1;
        }
        self.out_of_tolerance = 0;
        self.state()
    }

    pub fn record_out_of_tolerance(&mut self) -> SyncState {
        if self.is_synchronized() {
            self.out_of_tolerance += 1;
            if self.out_of_tolerance >= self.unlock_count {
                self.in_tolerance = 0;
                self.out_of_tolerance = 0;
            }
        } else {
            self.in_tolerance = 0;
        }
        self.state()
    }

    /// Drop lock immediately, e.g. after a missed scan deadline.
    pub fn force_unsynchronized(&mut self) {
        self.in_tolerance = 0;
        self.out_of_tolerance = 0;
        self.reference = None;
    }
}
