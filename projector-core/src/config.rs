//! Per-rig geometry and tuning.
//!
//! Everything that differs between drums lives here rather than in
//! constants, so the same engine can be run against simulated rigs of
//! other shapes.

use heapless::Vec;

use crate::clock::Ticks;
use crate::error::ConfigError;
use crate::timing::DelayMap;
use crate::{MAX_FACETS, MAX_LASER_PLANES};

/// Physical facet order to frame-buffer row order.
///
/// Drum facets are not ground in raster order: facet `k` sweeps the line
/// that belongs to row `map[k]`. The map is always a bijection on
/// `0..len`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacetMap {
    mirror_to_raster: Vec<u8, MAX_FACETS>,
}

impl FacetMap {
    pub fn new(mirror_to_raster: &[u8]) -> Result<Self, ConfigError> {
        let len = mirror_to_raster.len();
        if len == 0 || len > MAX_FACETS {
            return Err(ConfigError::FacetCount(len));
        }

        let mut seen: u32 = 0;
        for (facet, &entry) in mirror_to_raster.iter().enumerate() {
            let bit = 1u32 << (entry as u32 & 31);
            if usize::from(entry) >= len || seen & bit != 0 {
                return Err(ConfigError::FacetMapNotBijective { facet, entry });
            }
            seen |= bit;
        }

        let mut map = Vec::new();
        // Length was checked against the capacity above.
        let _ = map.extend_from_slice(mirror_to_raster);
        Ok(Self {
            mirror_to_raster: map,
        })
    }

    /// Facet `k` paints row `k`.
    pub fn identity(facets: usize) -> Result<Self, ConfigError> {
        if facets == 0 || facets > MAX_FACETS {
            return Err(ConfigError::FacetCount(facets));
        }
        let mut map = [0u8; MAX_FACETS];
        for (i, slot) in map.iter_mut().enumerate() {
            *slot = i as u8;
        }
        Self::new(&map[..facets])
    }

    pub fn len(&self) -> usize {
        self.mirror_to_raster.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mirror_to_raster.is_empty()
    }

    /// Frame row painted by physical facet `facet`.
    pub fn raster_row(&self, facet: usize) -> usize {
        usize::from(self.mirror_to_raster[facet % self.len()])
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.mirror_to_raster
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RigConfig {
    pub facet_map: FacetMap,
    /// Lasers sharing the drum, each reading its own block of rows.
    pub laser_planes: usize,
    /// Bytes per frame row (8 pixels each).
    pub row_bytes: usize,
    /// Rows between the start of consecutive laser planes.
    pub plane_stride: usize,
    /// Largest revolution-to-revolution change still counted as steady.
    pub sync_tolerance: Ticks,
    /// Consecutive steady revolutions needed to lock (N).
    pub lock_count: u8,
    /// Consecutive unsteady revolutions needed to drop lock (M).
    pub unlock_count: u8,
    /// Sensor edges closer together than this are treated as bounce.
    pub debounce: Ticks,
    /// Sync pulse to first facet, as a fraction of a revolution over 65536.
    pub first_facet_fraction: u16,
    pub delay_map: DelayMap,
    /// Offset change per calibration button press.
    pub calibration_step: i16,
    pub default_offset: i16,
    /// Laser level while seeking lock. On gives a visible line for alignment.
    pub idle_lasers_on: bool,
}

impl RigConfig {
    /// The eight-facet single-laser reference drum.
    pub fn reference() -> Self {
        Self {
            facet_map: FacetMap {
                mirror_to_raster: Vec::from_slice(&[0, 5, 2, 7, 4, 1, 6, 3])
                    .unwrap_or_default(),
            },
            laser_planes: 1,
            row_bytes: 8,
            plane_stride: 8,
            sync_tolerance: 200,
            lock_count: 8,
            unlock_count: 4,
            debounce: 8_000,
            first_facet_fraction: 0x4000,
            delay_map: DelayMap::REFERENCE,
            calibration_step: 2,
            default_offset: 0,
            idle_lasers_on: true,
        }
    }

    pub fn facet_count(&self) -> usize {
        self.facet_map.len()
    }

    /// Frame rows needed to cover every plane.
    pub fn rows_needed(&self) -> usize {
        self.plane_stride * (self.laser_planes - 1) + self.facet_count()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let facets = self.facet_count();
        if facets == 0 || facets > MAX_FACETS {
            return Err(ConfigError::FacetCount(facets));
        }
        if self.laser_planes == 0 || self.laser_planes > MAX_LASER_PLANES {
            return Err(ConfigError::LaserPlanes(self.laser_planes));
        }
        if self.row_bytes == 0 {
            return Err(ConfigError::EmptyRow);
        }
        if self.laser_planes > 1 && self.plane_stride < facets {
            return Err(ConfigError::PlaneStride {
                stride: self.plane_stride,
                facets,
            });
        }
        if self.lock_count == 0 || self.unlock_count == 0 {
            return Err(ConfigError::HysteresisCount);
        }
        let delay = self.first_facet_delay(self.debounce);
        if delay <= self.sync_tolerance {
            return Err(ConfigError::FirstFacetTooEarly {
                delay,
                tolerance: self.sync_tolerance,
            });
        }
        self.delay_map.validate()
    }

    /// Sync pulse to first facet on a revolution of `duration` ticks.
    ///
    /// The engine may wait out a late edge for up to the sync tolerance at
    /// the facet wrap, so on the fastest revolution the capture accepts
    /// this has to stay longer than the tolerance.
    pub fn first_facet_delay(&self, duration: Ticks) -> Ticks {
        ((u64::from(duration) * u64::from(self.first_facet_fraction)) >> 16) as Ticks
    }
}

impl Default for RigConfig {
    fn default() -> Self {
        Self::reference()
    }
}
