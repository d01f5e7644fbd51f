//! Sync-sensor edge capture, shared between the sensor interrupt and the
//! main loop.
//!
//! The interrupt side records the time of each accepted edge and counts
//! how many arrived since the main loop last looked. The main loop reads
//! and clears both inside one critical section, which is the only real
//! mutual-exclusion point in the system.

use core::cell::Cell;

use critical_section::{CriticalSection, Mutex};

use crate::clock::Ticks;

/// Latest revolution boundary handed to the main loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RevolutionEvent {
    /// Tick of the most recent accepted sensor edge.
    pub timestamp: Ticks,
    /// Edges accepted since the previous [`SyncCapture::take`]. More than
    /// one means the main loop fell behind by whole revolutions.
    pub pending: u8,
}

#[derive(Clone, Copy)]
struct CaptureState {
    last_accepted: Option<Ticks>,
    pending: u8,
    debounce: Ticks,
}

pub struct SyncCapture {
    state: Mutex<Cell<CaptureState>>,
}

impl SyncCapture {
    pub const fn new(debounce: Ticks) -> Self {
        Self {
            state: Mutex::new(Cell::new(CaptureState {
                last_accepted: None,
                pending: 0,
                debounce,
            })),
        }
    }

    /// Change the bounce threshold, e.g. after loading a rig config.
    pub fn set_debounce(&self, debounce: Ticks) {
        critical_section::with(|cs| {
            let cell = self.state.borrow(cs);
            let mut state = cell.get();
            state.debounce = debounce;
            cell.set(state);
        });
    }

    /// Record a sensor edge at `now`. Call from the sensor interrupt.
    ///
    /// Returns false when the edge came too soon after the last accepted
    /// one and was dropped as mechanical bounce.
    pub fn on_edge(&self, cs: CriticalSection<'_>, now: Ticks) -> bool {
        let cell = self.state.borrow(cs);
        let mut state = cell.get();

        if let Some(previous) = state.last_accepted {
            if now.wrapping_sub(previous) <= state.debounce {
                return false;
            }
        }

        state.last_accepted = Some(now);
        state.pending = state.pending.saturating_add(1);
        cell.set(state);
        true
    }

    /// Read and clear the pending revolution, if any.
    pub fn take(&self) -> Option<RevolutionEvent> {
        critical_section::with(|cs| {
            let cell = self.state.borrow(cs);
            let mut state = cell.get();
            if state.pending == 0 {
                return None;
            }
            let timestamp = state.last_accepted?;
            let event = RevolutionEvent {
                timestamp,
                pending: state.pending,
            };
            state.pending = 0;
            cell.set(state);
            Some(event)
        })
    }
}
