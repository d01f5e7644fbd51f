//! Push-button debouncing and edge latching.
//!
//! Buttons act on the press, not while held: a level only turns into an
//! edge when it was released on the previous poll.

use crate::clock::Ticks;

/// Debounced button levels, true while pressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ButtonLevels {
    pub left: bool,
    pub right: bool,
    pub select: bool,
}

impl ButtonLevels {
    fn to_array(self) -> [bool; 3] {
        [self.left, self.right, self.select]
    }

    fn from_array([left, right, select]: [bool; 3]) -> Self {
        Self {
            left,
            right,
            select,
        }
    }
}

/// Buttons that went down since the previous poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ButtonEdges {
    pub left: bool,
    pub right: bool,
    pub select: bool,
}

impl ButtonEdges {
    pub fn any(&self) -> bool {
        self.left || self.right || self.select
    }
}

#[derive(Debug, Clone, Default)]
pub struct ButtonLatch {
    previous: ButtonLevels,
}

impl ButtonLatch {
    pub const fn new() -> Self {
        Self {
            previous: ButtonLevels {
                left: false,
                right: false,
                select: false,
            },
        }
    }

    pub fn update(&mut self, levels: ButtonLevels) -> ButtonEdges {
        let edges = ButtonEdges {
            left: levels.left && !self.previous.left,
            right: levels.right && !self.previous.right,
            select: levels.select && !self.previous.select,
        };
        self.previous = levels;
        edges
    }
}

/// Contact debouncer. Polling rate varies with what the main loop is doing,
/// so a changed level has to hold for `settle` ticks rather than for a
/// number of polls before it is accepted.
#[derive(Debug, Clone)]
pub struct ButtonDebouncer {
    settle: Ticks,
    stable: ButtonLevels,
    /// When each button first read differently from its stable level.
    changed_at: [Option<Ticks>; 3],
}

impl ButtonDebouncer {
    pub const fn new(settle: Ticks) -> Self {
        Self {
            settle,
            stable: ButtonLevels {
                left: false,
                right: false,
                select: false,
            },
            changed_at: [None; 3],
        }
    }

    pub fn update(&mut self, raw: ButtonLevels, now: Ticks) -> ButtonLevels {
        let raw = raw.to_array();
        let mut stable = self.stable.to_array();

        for ((&level, current), changed_at) in raw
            .iter()
            .zip(stable.iter_mut())
            .zip(self.changed_at.iter_mut())
        {
            if level == *current {
                *changed_at = None;
                continue;
            }
            match *changed_at {
                None => *changed_at = Some(now),
                Some(since) if now.wrapping_sub(since) >= self.settle => {
                    *current = level;
                    *changed_at = None;
                }
                Some(_) => {}
            }
        }

        self.stable = ButtonLevels::from_array(stable);
        self.stable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRESSED: ButtonLevels = ButtonLevels {
        left: false,
        right: true,
        select: false,
    };

    #[test]
    fn press_fires_once_while_held() {
        let mut latch = ButtonLatch::new();
        let held = ButtonLevels {
            select: true,
            ..Default::default()
        };
        assert!(latch.update(held).select);
        assert!(!latch.update(held).select);
        assert!(!latch.update(ButtonLevels::default()).any());
        assert!(latch.update(held).select);
    }

    #[test]
    fn buttons_latch_independently() {
        let mut latch = ButtonLatch::new();
        latch.update(ButtonLevels {
            left: true,
            ..Default::default()
        });
        let edges = latch.update(ButtonLevels {
            left: true,
            right: true,
            select: false,
        });
        assert_eq!(
            edges,
            ButtonEdges {
                left: false,
                right: true,
                select: false
            }
        );
    }

    #[test]
    fn bounce_shorter_than_settle_is_ignored() {
        let mut contacts = ButtonDebouncer::new(1_000);
        assert_eq!(contacts.update(PRESSED, 0), ButtonLevels::default());
        assert_eq!(contacts.update(PRESSED, 600), ButtonLevels::default());
        // Released before settling; the timer starts over.
        contacts.update(ButtonLevels::default(), 700);
        assert_eq!(contacts.update(PRESSED, 1_200), ButtonLevels::default());
        assert_eq!(contacts.update(PRESSED, 2_100), ButtonLevels::default());
        assert_eq!(contacts.update(PRESSED, 2_200), PRESSED);
    }

    #[test]
    fn release_is_debounced_too() {
        let mut contacts = ButtonDebouncer::new(1_000);
        contacts.update(PRESSED, 0);
        contacts.update(PRESSED, 1_000);
        assert_eq!(contacts.update(ButtonLevels::default(), 1_500), PRESSED);
        assert_eq!(
            contacts.update(ButtonLevels::default(), 2_500),
            ButtonLevels::default()
        );
    }

    #[test]
    fn settle_time_spans_tick_wraparound() {
        let mut contacts = ButtonDebouncer::new(1_000);
        contacts.update(PRESSED, u32::MAX - 200);
        assert_eq!(contacts.update(PRESSED, 900), PRESSED);
    }
}
