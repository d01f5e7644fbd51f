//! Per-revolution scan timing.
//!
//! Everything here is derived from the duration of the last measured
//! revolution and used for the whole of the next one, so speed drift is
//! corrected one revolution late. The delay map constants were fitted
//! with that lag in place.

use log::warn;

use crate::clock::{Ticks, TICKS_PER_MICROSECOND};
use crate::error::ConfigError;

const TICKS_PER_SECOND: u32 = 1_000_000 * TICKS_PER_MICROSECOND;

/// Illumination duration to busy-wait count, fitted on a real rig.
///
/// Scanning a full row with delay count `min_count` takes `min_duration`
/// ticks, with `max_count` it takes `max_duration`. In between the
/// relation is linear. Outside that range the count saturates; it is
/// never extrapolated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DelayMap {
    pub min_duration: Ticks,
    pub max_duration: Ticks,
    pub min_count: u16,
    pub max_count: u16,
    /// Extra count between bits compared to between bytes. The byte loop
    /// has more fixed overhead, and this keeps pixel pitch even across
    /// byte boundaries.
    pub bit_differential: u16,
    /// Hard ceiling for any delay count.
    pub max_delay: u16,
}

impl DelayMap {
    /// Measured on the eight-facet reference drum, 64 pixels per row.
    pub const REFERENCE: Self = Self {
        min_duration: 1690,
        max_duration: 20257,
        min_count: 0,
        max_count: 240,
        bit_differential: 3,
        max_delay: 255,
    };

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_duration >= self.max_duration
            || self.min_count > self.max_count
            || self.max_count > self.max_delay
        {
            return Err(ConfigError::DelayMapRange);
        }
        Ok(())
    }

    /// Busy-wait count held after each byte.
    pub fn byte_delay(&self, illumination: Ticks) -> u16 {
        if illumination <= self.min_duration {
            return self.min_count;
        }
        if illumination >= self.max_duration {
            return self.max_count;
        }

        let span = u64::from(self.max_duration - self.min_duration);
        let counts = u64::from(self.max_count - self.min_count);
        let offset = u64::from(illumination - self.min_duration);
        self.min_count + (offset * counts / span) as u16
    }

    /// Busy-wait count held after each bit.
    pub fn bit_delay(&self, byte_delay: u16) -> u16 {
        byte_delay
            .saturating_add(self.bit_differential)
            .min(self.max_delay)
    }

    /// Re-fit the duration endpoints by timing real scans.
    ///
    /// `scan` renders one full row with the given byte delay count and
    /// returns how many ticks it took. Counts stay as configured; only the
    /// durations they map to are replaced. A measurement that does not
    /// grow with the count is rejected and the map is kept as is.
    pub fn measure<F>(&self, mut scan: F) -> Self
    where
        F: FnMut(u16, u16) -> Ticks,
    {
        let fastest = scan(self.min_count, self.bit_delay(self.min_count));
        let slowest = scan(self.max_count, self.bit_delay(self.max_count));

        if slowest <= fastest {
            warn!(
                "delay measurement not monotonic ({} >= {} ticks), keeping fitted map",
                fastest, slowest
            );
            return *self;
        }

        Self {
            min_duration: fastest,
            max_duration: slowest,
            ..*self
        }
    }
}

impl Default for DelayMap {
    fn default() -> Self {
        Self::REFERENCE
    }
}

/// Timing for one revolution's worth of facets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RevolutionTiming {
    /// Measured length of the last revolution.
    pub duration: Ticks,
    /// Sync pulse to the start of facet 0.
    pub first_facet_delay: Ticks,
    /// Start-to-start distance between facets.
    pub facet_interval: Ticks,
    /// How long the beam is painting during one facet.
    pub illumination: Ticks,
    pub byte_delay: u16,
    pub bit_delay: u16,
    /// Absolute tick at which facet 0 of the revolution starts.
    pub first_facet_at: Ticks,
}

impl RevolutionTiming {
    pub fn derive(
        sync_at: Ticks,
        duration: Ticks,
        facets: usize,
        first_facet_fraction: u16,
        map: &DelayMap,
    ) -> Self {
        let first_facet_delay =
            ((u64::from(duration) * u64::from(first_facet_fraction)) >> 16) as Ticks;
        let facet_interval = duration / facets.max(1) as Ticks;
        // Beam on for half the window to bound duty cycle and heat.
        let illumination = facet_interval / 2;
        let byte_delay = map.byte_delay(illumination);

        Self {
            duration,
            first_facet_delay,
            facet_interval,
            illumination,
            byte_delay,
            bit_delay: map.bit_delay(byte_delay),
            first_facet_at: sync_at.wrapping_add(first_facet_delay),
        }
    }

    /// Rebase the same timing onto a later sync pulse.
    pub fn rebased(&self, sync_at: Ticks) -> Self {
        Self {
            first_facet_at: sync_at.wrapping_add(self.first_facet_delay),
            ..*self
        }
    }

    pub fn revs_per_second(&self) -> u32 {
        if self.duration == 0 {
            0
        } else {
            TICKS_PER_SECOND / self.duration
        }
    }
}

/// Length of a single revolution ending at `current`.
///
/// When `pending` edges piled up since `previous`, the raw delta covers
/// several revolutions. The previous edge is moved forward by
/// `estimate * (pending - 1)`, where the estimate is the last single
/// revolution duration if known and an even split of the delta otherwise.
pub fn single_revolution(
    previous: Ticks,
    current: Ticks,
    pending: u8,
    last_duration: Option<Ticks>,
) -> Ticks {
    let raw = current.wrapping_sub(previous);
    if pending <= 1 {
        return raw;
    }

    let skipped = Ticks::from(pending - 1);
    let estimate = last_duration.unwrap_or(raw / Ticks::from(pending));
    let skipped_ticks = estimate.saturating_mul(skipped);
    if skipped_ticks >= raw {
        warn!(
            "catch-up estimate {} x {} exceeds raw delta {}",
            estimate, skipped, raw
        );
        return raw / Ticks::from(pending);
    }
    current.wrapping_sub(previous.wrapping_add(skipped_ticks))
}
