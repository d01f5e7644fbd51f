//! Revolution sync and scan timing for a rotating-mirror laser projector.
//!
//! A mirror drum spins at an uncontrolled, drifting speed. An optical
//! sensor fires once per revolution; from those edges this crate derives
//! when each facet sweeps the field of view and how fast to clock pixels
//! out to the laser lines while it does.
//!
//! This crate is `no_std` so the same engine runs on the AVR firmware and
//! inside the host simulator.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod calibration;
pub mod capture;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod input;
pub mod render;
pub mod sync;
pub mod timer;
pub mod timing;

pub use calibration::{CalibrationTable, Calibrator, ClockedStorage, NvStorage};
pub use capture::{RevolutionEvent, SyncCapture};
pub use clock::{SplitClock, Ticks};
pub use config::{FacetMap, RigConfig};
pub use engine::{EngineStatus, LossCause, ScanEngine, ScanIo, Step};
pub use error::ConfigError;
pub use frame::{FrameBuffer, RasterSource};
pub use input::{ButtonDebouncer, ButtonEdges, ButtonLatch, ButtonLevels};
pub use render::LaserDriver;
pub use sync::{SyncState, SyncTracker};
pub use timing::{DelayMap, RevolutionTiming};

/// Maximum number of mirror facets a rig may have.
pub const MAX_FACETS: usize = 16;

/// Maximum number of laser planes sharing one drum.
pub const MAX_LASER_PLANES: usize = 2;
