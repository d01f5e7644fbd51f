//! The main scan loop, one iteration per [`ScanEngine::step`].
//!
//! While seeking, the engine waits for revolution edges, feeds them through
//! the sync tracker and keeps the outputs idle. Once locked it spins until
//! each facet's start tick, paints the facet, and re-derives timing every
//! time the facet index wraps. Any missed deadline or run of unsteady
//! revolutions drops it back to seeking; nothing stops the loop.

use log::{debug, info, warn};

use crate::calibration::{CalibrationAction, CalibrationTable, Calibrator, NvStorage};
use crate::capture::RevolutionEvent;
use crate::clock::{ticks_until, Ticks};
use crate::config::RigConfig;
use crate::error::ConfigError;
use crate::frame::RasterSource;
use crate::input::ButtonEdges;
use crate::render::{render_facet, render_row, LaserDriver};
use crate::sync::{SyncState, SyncTracker};
use crate::timing::{single_revolution, DelayMap, RevolutionTiming};

/// Hardware the engine drives from the main context.
pub trait ScanIo: LaserDriver {
    /// Current tick, read through the main-context clock accessor.
    fn now(&mut self) -> Ticks;

    /// Read and clear the pending revolution edge.
    fn take_revolution(&mut self) -> Option<RevolutionEvent>;

    fn set_indicator(&mut self, on: bool);
}

/// What one loop iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Seeking, nothing changed.
    Idle,
    /// Lock acquired on this iteration.
    Acquired,
    /// Physical facet painted.
    Scanned { facet: usize },
    Lost(LossCause),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossCause {
    /// Revolution durations left tolerance for too long.
    Drift,
    /// A facet's start tick had already passed when checked.
    MissedDeadline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatus {
    pub state: SyncState,
    /// Next physical facet to paint.
    pub facet: usize,
    /// Tick at which that facet starts, offset included. None while
    /// seeking, when there is no schedule to report.
    pub next_scan_at: Option<Ticks>,
    pub revolutions: u32,
    pub timing: Option<RevolutionTiming>,
    pub calibrating_facet: usize,
}

pub struct ScanEngine {
    config: RigConfig,
    sync: SyncTracker,
    mode: SyncState,
    timing: Option<RevolutionTiming>,
    calibration: CalibrationTable,
    calibrator: Calibrator,
    facet: usize,
    /// Start of the next facet before its calibration offset.
    nominal_next: Ticks,
    /// Last sensor edge actually seen.
    last_edge: Option<Ticks>,
    last_duration: Option<Ticks>,
    /// Edge the current schedule hangs off, real or predicted.
    schedule_edge: Ticks,
    revolutions: u32,
}

impl ScanEngine {
    pub fn new(config: RigConfig, calibration: CalibrationTable) -> Result<Self, ConfigError> {
        config.validate()?;
        let sync = SyncTracker::new(config.lock_count, config.unlock_count, config.sync_tolerance);
        let calibrator = Calibrator::new(config.calibration_step);
        Ok(Self {
            config,
            sync,
            mode: SyncState::Unsynchronized,
            timing: None,
            calibration,
            calibrator,
            facet: 0,
            nominal_next: 0,
            last_edge: None,
            last_duration: None,
            schedule_edge: 0,
            revolutions: 0,
        })
    }

    pub fn config(&self) -> &RigConfig {
        &self.config
    }

    pub fn calibration(&self) -> &CalibrationTable {
        &self.calibration
    }

    pub fn calibration_mut(&mut self) -> &mut CalibrationTable {
        &mut self.calibration
    }

    pub fn state(&self) -> SyncState {
        self.mode
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            state: self.mode,
            facet: self.facet,
            next_scan_at: (self.mode == SyncState::Synchronized).then(|| self.scan_target()),
            revolutions: self.revolutions,
            timing: self.timing,
            calibrating_facet: self.calibrator.cursor(),
        }
    }

    /// One pass of the main loop. Button handling runs once per pass,
    /// after any busy-wait.
    pub fn step<I, R, S>(
        &mut self,
        io: &mut I,
        frame: &R,
        storage: &mut S,
        buttons: ButtonEdges,
    ) -> Step
    where
        I: ScanIo + ?Sized,
        R: RasterSource + ?Sized,
        S: NvStorage + ?Sized,
    {
        let step = match self.mode {
            SyncState::Unsynchronized => self.seek(io),
            SyncState::Synchronized => self.scan(io, frame),
        };

        if buttons.any() {
            let action = self
                .calibrator
                .apply(buttons, &mut self.calibration, storage);
            if action == CalibrationAction::Saved {
                info!("offsets {:?}", self.calibration.offsets());
            }
        }

        step
    }

    /// Time full dark scans at the delay map's end points and re-fit it.
    ///
    /// Lasers stay off: the writes still happen, only with zero levels, so
    /// the measured cost matches a real scan.
    pub fn measure_delays<I, R>(&mut self, io: &mut I, frame: &R) -> DelayMap
    where
        I: ScanIo + ?Sized,
        R: RasterSource + ?Sized,
    {
        let planes = self.config.laser_planes;
        let map = self.config.delay_map.measure(|byte_delay, bit_delay| {
            let mut dark = Dark(&mut *io);
            let start = dark.0.now();
            render_row(frame, 0, planes, byte_delay, bit_delay, &mut dark);
            dark.0.now().wrapping_sub(start)
        });
        info!(
            "delay map {}..{} ticks -> {}..{}",
            map.min_duration, map.max_duration, map.min_count, map.max_count
        );
        self.config.delay_map = map;
        map
    }

    fn seek<I: ScanIo + ?Sized>(&mut self, io: &mut I) -> Step {
        self.idle_outputs(io);

        let Some(event) = io.take_revolution() else {
            return Step::Idle;
        };
        let state = self.consume(event);

        // Best effort even without lock: keep the schedule current so the
        // first locked facet starts on time.
        self.facet = 0;
        if let Some(timing) = self.timing {
            self.nominal_next = timing.first_facet_at;
        }

        match (state, self.timing) {
            (SyncState::Synchronized, Some(timing)) => {
                self.mode = SyncState::Synchronized;
                io.set_lasers(0);
                io.set_indicator(true);
                info!(
                    "locked: {} rev/s, delays {}/{}",
                    timing.revs_per_second(),
                    timing.bit_delay,
                    timing.byte_delay
                );
                Step::Acquired
            }
            _ => Step::Idle,
        }
    }

    fn scan<I, R>(&mut self, io: &mut I, frame: &R) -> Step
    where
        I: ScanIo + ?Sized,
        R: RasterSource + ?Sized,
    {
        let Some(timing) = self.timing else {
            return self.lose(io, LossCause::Drift);
        };

        let target = self.scan_target();
        let remaining = ticks_until(target, io.now());
        if remaining <= 0 {
            warn!("missed facet {} by {} ticks", self.facet, -remaining);
            self.sync.force_unsynchronized();
            return self.lose(io, LossCause::MissedDeadline);
        }
        while ticks_until(target, io.now()) > 0 {}

        let facet = self.facet;
        render_facet(
            frame,
            &self.config.facet_map,
            facet,
            self.config.laser_planes,
            timing.byte_delay,
            timing.bit_delay,
            io,
        );

        self.nominal_next = self.nominal_next.wrapping_add(timing.facet_interval);
        self.facet += 1;
        if self.facet == self.config.facet_count() {
            self.facet = 0;
            if self.next_revolution(io) == SyncState::Unsynchronized {
                return self.lose(io, LossCause::Drift);
            }
        }

        Step::Scanned { facet }
    }

    /// Re-derive timing at the facet wrap from the next edge.
    ///
    /// The edge due one revolution after the current schedule may still be
    /// on its way, so this waits for it until it is overdue by more than
    /// the sync tolerance. Only then is it predicted and the revolution
    /// counted as unsteady.
    fn next_revolution<I: ScanIo + ?Sized>(&mut self, io: &mut I) -> SyncState {
        loop {
            let Some(timing) = self.timing else {
                return SyncState::Unsynchronized;
            };
            let expected = self.schedule_edge.wrapping_add(timing.duration);
            let overdue = expected.wrapping_add(self.config.sync_tolerance);

            let state = if let Some(event) = io.take_revolution() {
                let state = self.consume(event);
                let stale = self
                    .timing
                    .is_some_and(|next| ticks_until(next.first_facet_at, io.now()) <= 0);
                if stale && state == SyncState::Synchronized {
                    // Edge of the revolution just painted; its successor
                    // starts the next schedule.
                    debug!("late sync edge at {}, waiting a revolution", event.timestamp);
                    continue;
                }
                state
            } else if ticks_until(overdue, io.now()) < 0 {
                self.schedule_edge = expected;
                self.timing = Some(timing.rebased(expected));
                debug!("no sync edge by {}, predicting {}", overdue, expected);
                self.sync.record_out_of_tolerance()
            } else {
                continue;
            };

            if let Some(timing) = self.timing {
                self.nominal_next = timing.first_facet_at;
            }
            return state;
        }
    }

    /// Measure the revolution ending at `event` and derive its timing.
    fn consume(&mut self, event: RevolutionEvent) -> SyncState {
        let Some(previous) = self.last_edge else {
            self.last_edge = Some(event.timestamp);
            self.schedule_edge = event.timestamp;
            return self.sync.state();
        };

        let duration = single_revolution(
            previous,
            event.timestamp,
            event.pending,
            self.last_duration,
        );
        self.last_edge = Some(event.timestamp);
        self.last_duration = Some(duration);
        self.schedule_edge = event.timestamp;
        self.revolutions = self.revolutions.wrapping_add(u32::from(event.pending));

        let state = self.sync.observe(duration);
        let timing = RevolutionTiming::derive(
            event.timestamp,
            duration,
            self.config.facet_count(),
            self.config.first_facet_fraction,
            &self.config.delay_map,
        );
        debug!(
            "rev {} ticks (x{}), in {} out {}, delays {}/{}",
            duration,
            event.pending,
            self.sync.in_tolerance_count(),
            self.sync.out_of_tolerance_count(),
            timing.bit_delay,
            timing.byte_delay
        );
        self.timing = Some(timing);
        state
    }

    fn scan_target(&self) -> Ticks {
        let offset = self.calibration.offset(self.facet);
        self.nominal_next.wrapping_add_signed(i32::from(offset))
    }

    fn lose<I: ScanIo + ?Sized>(&mut self, io: &mut I, cause: LossCause) -> Step {
        self.mode = SyncState::Unsynchronized;
        self.facet = 0;
        self.idle_outputs(io);
        info!("sync lost: {:?}", cause);
        Step::Lost(cause)
    }

    fn idle_outputs<I: ScanIo + ?Sized>(&self, io: &mut I) {
        let levels = if self.config.idle_lasers_on {
            ((1u16 << self.config.laser_planes) - 1) as u8
        } else {
            0
        };
        io.set_lasers(levels);
        io.set_indicator(false);
    }
}

/// Forwards everything but forces laser levels to zero.
struct Dark<'a, I: ?Sized>(&'a mut I);

impl<I: ScanIo + ?Sized> LaserDriver for Dark<'_, I> {
    fn set_lasers(&mut self, _levels: u8) {
        self.0.set_lasers(0);
    }

    fn hold(&mut self, count: u16) {
        self.0.hold(count);
    }
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use super::*;
    use crate::capture::SyncCapture;
    use crate::frame::FrameBuffer;

    const PERIOD: Ticks = 80_000;
    const FIRST_EDGE: Ticks = 1_000;

    /// Virtual rig: every call costs time, sensor edges fire as time passes.
    struct Rig {
        now: Ticks,
        edges: Vec<Ticks>,
        next_edge: usize,
        capture: SyncCapture,
        levels: u8,
        indicator: bool,
        hold_scale: u32,
        lit_writes: usize,
    }

    impl Rig {
        fn with_periods(periods: &[(usize, Ticks)]) -> Self {
            let mut edges = Vec::new();
            let mut t = FIRST_EDGE;
            for &(count, period) in periods {
                for _ in 0..count {
                    edges.push(t);
                    t += period;
                }
            }
            Self {
                now: 0,
                edges,
                next_edge: 0,
                capture: SyncCapture::new(8_000),
                levels: 0,
                indicator: false,
                hold_scale: 1,
                lit_writes: 0,
            }
        }

        fn advance(&mut self, ticks: Ticks) {
            self.now += ticks;
            while self.next_edge < self.edges.len() && self.edges[self.next_edge] <= self.now {
                let at = self.edges[self.next_edge];
                critical_section::with(|cs| self.capture.on_edge(cs, at));
                self.next_edge += 1;
            }
        }
    }

    impl LaserDriver for Rig {
        fn set_lasers(&mut self, levels: u8) {
            self.levels = levels;
            if levels != 0 {
                self.lit_writes += 1;
            }
            self.advance(1);
        }

        fn hold(&mut self, count: u16) {
            self.advance(Ticks::from(count) * self.hold_scale);
        }
    }

    impl ScanIo for Rig {
        fn now(&mut self) -> Ticks {
            self.advance(1);
            self.now
        }

        fn take_revolution(&mut self) -> Option<RevolutionEvent> {
            self.advance(1);
            self.capture.take()
        }

        fn set_indicator(&mut self, on: bool) {
            self.indicator = on;
        }
    }

    struct Ram([u8; 64]);

    impl NvStorage for Ram {
        fn read_byte(&mut self, addr: u16) -> u8 {
            self.0[usize::from(addr)]
        }

        fn update_byte(&mut self, addr: u16, value: u8) {
            self.0[usize::from(addr)] = value;
        }
    }

    fn engine() -> ScanEngine {
        let config = RigConfig::reference();
        let table = CalibrationTable::defaults(config.facet_count(), 0);
        ScanEngine::new(config, table).unwrap()
    }

    fn frame() -> FrameBuffer<64> {
        let mut frame = FrameBuffer::for_rig(&RigConfig::reference()).unwrap();
        for row in 0..8 {
            frame.row_mut(row)[0] = 0x80;
        }
        frame
    }

    fn run_until<F>(engine: &mut ScanEngine, rig: &mut Rig, limit: Ticks, mut stop: F) -> Vec<Step>
    where
        F: FnMut(Step) -> bool,
    {
        let frame = frame();
        let mut ram = Ram([0xFF; 64]);
        let mut steps = Vec::new();
        while rig.now < limit {
            let step = engine.step(rig, &frame, &mut ram, ButtonEdges::default());
            if step != Step::Idle {
                steps.push(step);
            }
            if stop(step) {
                break;
            }
        }
        steps
    }

    #[test]
    fn seeking_keeps_lasers_on_and_indicator_off() {
        let mut engine = engine();
        let mut rig = Rig::with_periods(&[(2, PERIOD)]);
        let mut ram = Ram([0xFF; 64]);
        let step = engine.step(&mut rig, &frame(), &mut ram, ButtonEdges::default());
        assert_eq!(step, Step::Idle);
        assert_eq!(rig.levels, 1);
        assert!(!rig.indicator);
    }

    #[test]
    fn locks_on_the_ninth_edge() {
        let mut engine = engine();
        let mut rig = Rig::with_periods(&[(20, PERIOD)]);
        let steps = run_until(&mut engine, &mut rig, 2_000_000, |s| s == Step::Acquired);

        assert_eq!(steps.last(), Some(&Step::Acquired));
        // Eight measured revolutions need nine edges.
        let ninth_edge = FIRST_EDGE + 8 * PERIOD;
        assert!(rig.now >= ninth_edge && rig.now < ninth_edge + 100);
        assert_eq!(engine.state(), SyncState::Synchronized);
        assert!(rig.indicator);
        assert_eq!(rig.levels, 0);
    }

    #[test]
    fn scans_every_facet_in_physical_order() {
        let mut engine = engine();
        let mut rig = Rig::with_periods(&[(20, PERIOD)]);
        run_until(&mut engine, &mut rig, 2_000_000, |s| s == Step::Acquired);
        rig.lit_writes = 0;

        let mut scanned = 0;
        let steps = run_until(&mut engine, &mut rig, 2_000_000, |s| {
            if matches!(s, Step::Scanned { .. }) {
                scanned += 1;
            }
            scanned == 16
        });
        let facets: Vec<usize> = steps
            .iter()
            .filter_map(|s| match s {
                Step::Scanned { facet } => Some(*facet),
                _ => None,
            })
            .collect();
        assert_eq!(facets, [0, 1, 2, 3, 4, 5, 6, 7, 0, 1, 2, 3, 4, 5, 6, 7]);
        // One lit pixel per row.
        assert_eq!(rig.lit_writes, 16);
        assert_eq!(engine.state(), SyncState::Synchronized);
    }

    #[test]
    fn first_facet_starts_a_quarter_revolution_after_sync() {
        let mut engine = engine();
        let mut rig = Rig::with_periods(&[(20, PERIOD)]);
        run_until(&mut engine, &mut rig, 2_000_000, |s| s == Step::Acquired);

        let status = engine.status();
        let ninth_edge = FIRST_EDGE + 8 * PERIOD;
        assert_eq!(status.facet, 0);
        assert_eq!(status.next_scan_at, Some(ninth_edge + PERIOD / 4));
        let timing = status.timing.unwrap();
        assert_eq!(timing.facet_interval, PERIOD / 8);
        assert_eq!(timing.byte_delay, 42);
    }

    #[test]
    fn calibration_offset_moves_only_its_facet() {
        let mut plain = engine();
        let mut trimmed = engine();
        trimmed.calibration_mut().set_offset(2, 300);

        let mut targets = Vec::new();
        for engine in [&mut plain, &mut trimmed] {
            let mut rig = Rig::with_periods(&[(20, PERIOD)]);
            run_until(engine, &mut rig, 2_000_000, |s| s == Step::Scanned { facet: 1 });
            let at_two = engine.status().next_scan_at.unwrap();
            run_until(engine, &mut rig, 2_000_000, |s| s == Step::Scanned { facet: 2 });
            let at_three = engine.status().next_scan_at.unwrap();
            targets.push((at_two, at_three));
        }

        assert_eq!(targets[1].0, targets[0].0 + 300);
        assert_eq!(targets[1].1, targets[0].1);
    }

    #[test]
    fn slow_render_misses_the_next_deadline() {
        let mut engine = engine();
        let mut rig = Rig::with_periods(&[(40, PERIOD)]);
        run_until(&mut engine, &mut rig, 4_000_000, |s| s == Step::Acquired);

        rig.hold_scale = 10;
        let steps = run_until(&mut engine, &mut rig, 4_000_000, |s| {
            matches!(s, Step::Lost(_))
        });
        assert_eq!(steps.last(), Some(&Step::Lost(LossCause::MissedDeadline)));
        assert_eq!(engine.state(), SyncState::Unsynchronized);
        assert_eq!(engine.status().next_scan_at, None);
        assert_eq!(rig.levels, 1);
    }

    #[test]
    fn sustained_speed_change_drops_lock_after_four_revolutions() {
        let mut engine = engine();
        let mut rig = Rig::with_periods(&[(9, PERIOD), (20, PERIOD + 400)]);
        run_until(&mut engine, &mut rig, 4_000_000, |s| s == Step::Acquired);
        let locked_at = engine.status().revolutions;

        let steps = run_until(&mut engine, &mut rig, 4_000_000, |s| {
            matches!(s, Step::Lost(_))
        });
        assert_eq!(steps.last(), Some(&Step::Lost(LossCause::Drift)));
        // One steady revolution at the old speed, then four slow ones.
        assert_eq!(engine.status().revolutions, locked_at + 5);
    }

    #[test]
    fn relocks_after_losing_sync() {
        let mut engine = engine();
        let mut rig = Rig::with_periods(&[(60, PERIOD)]);
        run_until(&mut engine, &mut rig, 6_000_000, |s| s == Step::Acquired);
        rig.hold_scale = 10;
        run_until(&mut engine, &mut rig, 6_000_000, |s| matches!(s, Step::Lost(_)));
        rig.hold_scale = 1;

        let steps = run_until(&mut engine, &mut rig, 6_000_000, |s| s == Step::Acquired);
        assert_eq!(steps.last(), Some(&Step::Acquired));
    }

    #[test]
    fn missing_sensor_unlocks_on_prediction_alone() {
        let mut engine = engine();
        // Sensor dies right after lock.
        let mut rig = Rig::with_periods(&[(9, PERIOD)]);
        run_until(&mut engine, &mut rig, 4_000_000, |s| s == Step::Acquired);

        let steps = run_until(&mut engine, &mut rig, 4_000_000, |s| {
            matches!(s, Step::Lost(_))
        });
        assert_eq!(steps.last(), Some(&Step::Lost(LossCause::Drift)));
        let scanned = steps
            .iter()
            .filter(|s| matches!(s, Step::Scanned { .. }))
            .count();
        // The fourth revolution's last facet reports the loss instead.
        assert_eq!(scanned, 4 * 8 - 1);
    }

    fn early_first_facet_engine() -> ScanEngine {
        let mut config = RigConfig::reference();
        // 2_500 ticks after sync on this drum, so every facet wraps before
        // the next edge is in.
        config.first_facet_fraction = 0x0800;
        let table = CalibrationTable::defaults(config.facet_count(), 0);
        ScanEngine::new(config, table).unwrap()
    }

    #[test]
    fn early_first_facet_waits_for_the_edge_at_wrap() {
        let mut engine = early_first_facet_engine();
        let mut rig = Rig::with_periods(&[(60, PERIOD)]);
        let steps = run_until(&mut engine, &mut rig, FIRST_EDGE + 55 * PERIOD, |_| false);

        assert_eq!(steps.iter().filter(|s| **s == Step::Acquired).count(), 1);
        assert!(!steps.iter().any(|s| matches!(s, Step::Lost(_))));
        let scanned = steps
            .iter()
            .filter(|s| matches!(s, Step::Scanned { .. }))
            .count();
        assert!(scanned >= 40 * 8, "{scanned}");
        assert_eq!(engine.sync.out_of_tolerance_count(), 0);
        // Still hanging off real edges, not predictions.
        let next = engine.status().next_scan_at.unwrap();
        assert_eq!((next - FIRST_EDGE) % (PERIOD / 8), PERIOD / 32);
    }

    #[test]
    fn one_late_edge_does_not_cost_the_lock() {
        let mut engine = early_first_facet_engine();
        // The 22nd edge comes 300 ticks late and the drum keeps that phase.
        let mut rig = Rig::with_periods(&[(20, PERIOD), (1, PERIOD + 300), (30, PERIOD)]);
        let steps = run_until(&mut engine, &mut rig, FIRST_EDGE + 45 * PERIOD, |_| false);

        assert_eq!(steps.iter().filter(|s| **s == Step::Acquired).count(), 1);
        assert!(!steps.iter().any(|s| matches!(s, Step::Lost(_))));
        assert_eq!(engine.state(), SyncState::Synchronized);
        assert_eq!(engine.sync.out_of_tolerance_count(), 0);
    }

    #[test]
    fn buttons_drive_calibration_and_save_on_wrap() {
        let mut engine = engine();
        let mut rig = Rig::with_periods(&[(2, PERIOD)]);
        let mut ram = Ram([0xFF; 64]);
        let frame = frame();

        let right = ButtonEdges {
            right: true,
            ..Default::default()
        };
        let select = ButtonEdges {
            select: true,
            ..Default::default()
        };
        engine.step(&mut rig, &frame, &mut ram, right);
        for _ in 0..8 {
            engine.step(&mut rig, &frame, &mut ram, select);
        }

        let stored = CalibrationTable::load(&mut ram, 8, 0);
        assert_eq!(stored.offset(0), 2);
        assert_eq!(stored.offsets()[1..], [0; 7]);
    }

    #[test]
    fn measure_delays_refits_without_lighting_lasers() {
        let mut engine = engine();
        let mut rig = Rig::with_periods(&[]);
        let mut frame = frame();
        frame.row_mut(0).fill(0xFF);

        let map = engine.measure_delays(&mut rig, &frame);
        assert_eq!(rig.lit_writes, 0);
        // 64 pixel writes, the closing off write and the second clock read.
        let fixed = 64 + 1 + 1;
        assert_eq!(map.min_duration, fixed + 56 * 3);
        assert_eq!(map.max_duration, fixed + 56 * 243 + 8 * 240);
        assert_eq!(engine.config().delay_map, map);
    }
}
