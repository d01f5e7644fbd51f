//! Closed-loop rig simulator.
//!
//! Runs the real scan engine against a virtual drum. Sensor pulses come
//! from a drum model, the clock is the real split clock fed a 16-bit
//! counter, and each hardware call costs virtual time roughly the way it
//! does on the AVR.

use std::collections::VecDeque;
use std::ops::Range;

use anyhow::{Context, Result};
use indicatif::ProgressBar;
use projector_core::clock::TICKS_PER_MICROSECOND;
use projector_core::frame::draw_test_card;
use projector_core::{
    ButtonEdges, CalibrationTable, DelayMap, EngineStatus, FrameBuffer, LaserDriver, LossCause,
    RevolutionEvent, RigConfig, ScanEngine, ScanIo, SplitClock, Step, SyncCapture, Ticks,
};
use tracing::{debug, info};

use crate::eeprom::EepromImage;

/// Large enough for any geometry the CLI accepts.
const FRAME_BYTES: usize = 4096;

/// Reading TCNT1 and extending it.
const READ_COST: u64 = 2;
const WRITE_COST: u64 = 1;
const TAKE_COST: u64 = 2;
const INDICATOR_COST: u64 = 4;
/// One delay-loop iteration is four cycles, half a tick.
const HOLD_COST_NUM: u64 = 1;
const HOLD_COST_DEN: u64 = 2;

/// A bounce pulse lands this long after the real one.
const BOUNCE_DELAY: u64 = 300;

#[derive(Debug, Clone)]
pub struct DrumModel {
    /// Nominal revolution length.
    pub period: Ticks,
    /// Peak random deviation of each revolution from nominal.
    pub jitter: Ticks,
    /// Add a bounce pulse after every nth real one.
    pub bounce_every: Option<u32>,
    /// Revolutions whose sensor pulse never arrives.
    pub dropout: Option<Range<u32>>,
    /// From revolution `.0` on, the nominal period is `.1`.
    pub speed_step: Option<(u32, Ticks)>,
    pub seed: u32,
}

impl DrumModel {
    pub fn steady(period: Ticks) -> Self {
        Self {
            period,
            jitter: 0,
            bounce_every: None,
            dropout: None,
            speed_step: None,
            seed: 0x2545_F491,
        }
    }

    /// True revolution boundaries and the pulses the sensor reports.
    fn schedule(&self, revolutions: u32) -> (Vec<u64>, Vec<u64>) {
        let mut rng = XorShift(self.seed.max(1));
        let mut boundaries = Vec::with_capacity(revolutions as usize + 1);
        let mut pulses = Vec::new();
        let mut at = u64::from(self.period / 3);

        for rev in 0..=revolutions {
            boundaries.push(at);

            let dropped = self.dropout.as_ref().is_some_and(|r| r.contains(&rev));
            if !dropped {
                pulses.push(at);
                if self.bounce_every.is_some_and(|n| n > 0 && rev % n == 0) {
                    pulses.push(at + BOUNCE_DELAY);
                }
            }

            let nominal = match self.speed_step {
                Some((from, period)) if rev >= from => period,
                _ => self.period,
            };
            let spread = 2 * u64::from(self.jitter) + 1;
            let deviation = (u64::from(rng.next()) % spread) as i64 - i64::from(self.jitter);
            at = (at as i64 + i64::from(nominal) + deviation) as u64;
        }

        (boundaries, pulses)
    }
}

struct XorShift(u32);

impl XorShift {
    fn next(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }
}

/// The virtual board handed to the engine.
pub struct SimRig {
    now: u64,
    clock: SplitClock,
    capture: SyncCapture,
    pulses: VecDeque<u64>,
    hold_remainder: u64,
    levels: u8,
    indicator: bool,
    /// Set by a clock read; the next laser write marks a scan start.
    after_read: bool,
    scan_start: Option<u64>,
    bounces_rejected: u32,
}

impl SimRig {
    fn new(pulses: Vec<u64>, debounce: Ticks) -> Self {
        Self {
            now: 0,
            clock: SplitClock::new(),
            capture: SyncCapture::new(debounce),
            pulses: pulses.into(),
            hold_remainder: 0,
            levels: 0,
            indicator: false,
            after_read: false,
            scan_start: None,
            bounces_rejected: 0,
        }
    }

    fn advance(&mut self, ticks: u64) {
        self.now += ticks;
        while let Some(&at) = self.pulses.front() {
            if at > self.now {
                break;
            }
            self.pulses.pop_front();
            // The interrupt reads the counter as it stood at the pulse.
            let stamp = self.clock.now_interrupt(at as u16);
            let accepted = critical_section::with(|cs| self.capture.on_edge(cs, stamp));
            if !accepted {
                self.bounces_rejected += 1;
            }
        }
    }
}

impl LaserDriver for SimRig {
    fn set_lasers(&mut self, levels: u8) {
        if self.after_read {
            self.scan_start = Some(self.now);
            self.after_read = false;
        }
        self.levels = levels;
        self.advance(WRITE_COST);
    }

    fn hold(&mut self, count: u16) {
        let cost = u64::from(count) * HOLD_COST_NUM + self.hold_remainder;
        self.hold_remainder = cost % HOLD_COST_DEN;
        self.advance(cost / HOLD_COST_DEN);
    }
}

impl ScanIo for SimRig {
    fn now(&mut self) -> Ticks {
        self.advance(READ_COST);
        self.after_read = true;
        self.clock.now_main(self.now as u16)
    }

    fn take_revolution(&mut self) -> Option<RevolutionEvent> {
        self.advance(TAKE_COST);
        self.capture.take()
    }

    fn set_indicator(&mut self, on: bool) {
        self.indicator = on;
        self.advance(INDICATOR_COST);
    }
}

#[derive(Debug, Clone)]
pub struct SimReport {
    pub revolutions: u32,
    pub facets_scanned: u64,
    pub locks: u32,
    pub lost_drift: u32,
    pub lost_deadline: u32,
    pub bounces_rejected: u32,
    /// Time of the first lock, microseconds.
    pub first_lock_us: Option<u64>,
    /// Largest distance between a scan start and where the true drum
    /// position says it belonged, ticks.
    pub max_start_error: u64,
    pub mean_start_error: f64,
    pub delay_map: DelayMap,
    pub status: EngineStatus,
    pub indicator: bool,
}

pub fn run(
    config: RigConfig,
    calibration: CalibrationTable,
    drum: &DrumModel,
    revolutions: u32,
    progress: &ProgressBar,
) -> Result<SimReport> {
    let facets = config.facet_count();
    let fraction = config.first_facet_fraction;
    let debounce = config.debounce;

    let mut frame = FrameBuffer::<FRAME_BYTES>::for_rig(&config).context("sizing frame buffer")?;
    let _ = draw_test_card(&mut frame, "SIM");

    let mut engine = ScanEngine::new(config, calibration).context("building scan engine")?;
    let mut storage = EepromImage::erased();

    let (boundaries, pulses) = drum.schedule(revolutions);
    let end = boundaries.last().copied().unwrap_or(0);
    let mut rig = SimRig::new(pulses, debounce);

    let delay_map = engine.measure_delays(&mut rig, &frame);
    info!(
        min = delay_map.min_duration,
        max = delay_map.max_duration,
        "measured delay map"
    );

    let mut report = SimReport {
        revolutions,
        facets_scanned: 0,
        locks: 0,
        lost_drift: 0,
        lost_deadline: 0,
        bounces_rejected: 0,
        first_lock_us: None,
        max_start_error: 0,
        mean_start_error: 0.0,
        delay_map,
        status: engine.status(),
        indicator: false,
    };
    let mut error_sum = 0u64;
    let mut shown = 0u64;

    while rig.now < end {
        // Same order as the firmware loop: a clock read every pass.
        rig.now();
        match engine.step(&mut rig, &frame, &mut storage, ButtonEdges::default()) {
            Step::Idle => {}
            Step::Acquired => {
                report.locks += 1;
                if report.first_lock_us.is_none() {
                    report.first_lock_us = Some(micros(rig.now));
                }
                debug!(at_us = micros(rig.now), "lock acquired");
            }
            Step::Scanned { facet } => {
                report.facets_scanned += 1;
                if let Some(start) = rig.scan_start.take() {
                    let error = start_error(&boundaries, start, facet, facets, fraction);
                    report.max_start_error = report.max_start_error.max(error);
                    error_sum += error;
                }
            }
            Step::Lost(LossCause::Drift) => report.lost_drift += 1,
            Step::Lost(LossCause::MissedDeadline) => report.lost_deadline += 1,
        }

        let passed = boundaries.partition_point(|&b| b <= rig.now) as u64;
        if passed != shown {
            shown = passed;
            progress.set_position(passed.min(u64::from(revolutions)));
        }
    }
    progress.finish_and_clear();

    if report.facets_scanned > 0 {
        report.mean_start_error = error_sum as f64 / report.facets_scanned as f64;
    }
    report.bounces_rejected = rig.bounces_rejected;
    report.status = engine.status();
    report.indicator = rig.indicator;
    Ok(report)
}

/// Simulated time never wraps, so it stays wider than [`Ticks`].
fn micros(ticks: u64) -> u64 {
    ticks / u64::from(TICKS_PER_MICROSECOND)
}

/// Distance from `start` to the closest ideal start of `facet`, judged
/// against the revolutions around it.
fn start_error(boundaries: &[u64], start: u64, facet: usize, facets: usize, fraction: u16) -> u64 {
    let index = boundaries.partition_point(|&b| b <= start);
    let first = index.saturating_sub(2);
    let last = index.min(boundaries.len().saturating_sub(1));

    (first..last)
        .map(|rev| {
            let at = boundaries[rev];
            let duration = boundaries[rev + 1] - at;
            let first_delay = (duration * u64::from(fraction)) >> 16;
            let ideal = at + first_delay + facet as u64 * (duration / facets as u64);
            start.abs_diff(ideal)
        })
        .min()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: Ticks = 40_000;

    fn simulate(drum: &DrumModel, revolutions: u32) -> SimReport {
        let config = RigConfig::reference();
        let table = CalibrationTable::defaults(config.facet_count(), 0);
        run(config, table, drum, revolutions, &ProgressBar::hidden()).unwrap()
    }

    #[test]
    fn steady_drum_locks_once_and_scans_on_time() {
        let report = simulate(&DrumModel::steady(PERIOD), 30);

        assert_eq!(report.locks, 1);
        assert_eq!(report.lost_drift + report.lost_deadline, 0);
        // Nine pulses to lock, then every facet of the rest.
        assert!(report.facets_scanned >= 8 * 19, "{}", report.facets_scanned);
        assert!(report.max_start_error <= 4, "{}", report.max_start_error);
        assert!(report.indicator);
    }

    #[test]
    fn early_first_facet_holds_lock_on_a_steady_drum() {
        let mut config = RigConfig::reference();
        config.first_facet_fraction = 0x0800;
        let table = CalibrationTable::defaults(config.facet_count(), 0);
        let report = run(config, table, &DrumModel::steady(PERIOD), 30, &ProgressBar::hidden()).unwrap();

        assert_eq!(report.locks, 1);
        assert_eq!(report.lost_drift + report.lost_deadline, 0);
        assert!(report.facets_scanned >= 8 * 19, "{}", report.facets_scanned);
    }

    #[test]
    fn measured_delay_map_replaces_the_reference_fit() {
        let report = simulate(&DrumModel::steady(PERIOD), 12);
        assert_ne!(report.delay_map, DelayMap::REFERENCE);
        assert!(report.delay_map.min_duration < report.delay_map.max_duration);
    }

    #[test]
    fn bounce_pulses_are_rejected_without_losing_lock() {
        let drum = DrumModel {
            bounce_every: Some(3),
            ..DrumModel::steady(PERIOD)
        };
        let report = simulate(&drum, 30);
        assert!(report.bounces_rejected >= 9);
        assert_eq!(report.locks, 1);
        assert_eq!(report.lost_drift + report.lost_deadline, 0);
    }

    #[test]
    fn small_jitter_keeps_lock() {
        let drum = DrumModel {
            jitter: 40,
            ..DrumModel::steady(PERIOD)
        };
        let report = simulate(&drum, 40);
        assert_eq!(report.locks, 1);
        assert_eq!(report.lost_drift + report.lost_deadline, 0);
    }

    #[test]
    fn dead_sensor_unlocks_then_relocks() {
        let drum = DrumModel {
            dropout: Some(15..21),
            ..DrumModel::steady(PERIOD)
        };
        let report = simulate(&drum, 45);
        assert_eq!(report.lost_drift, 1);
        assert_eq!(report.locks, 2);
        assert!(!report.indicator || report.status.state == projector_core::SyncState::Synchronized);
    }

    #[test]
    fn speed_change_forces_a_relock() {
        let drum = DrumModel {
            speed_step: Some((15, PERIOD + 2_000)),
            ..DrumModel::steady(PERIOD)
        };
        let report = simulate(&drum, 50);
        assert!(report.lost_drift + report.lost_deadline >= 1);
        assert!(report.locks >= 2);
        assert_eq!(report.status.state, projector_core::SyncState::Synchronized);
    }

    #[test]
    fn schedule_is_deterministic() {
        let drum = DrumModel {
            jitter: 100,
            ..DrumModel::steady(PERIOD)
        };
        assert_eq!(drum.schedule(10), drum.schedule(10));
    }
}
