use thiserror::Error;

/// Rejected rig configuration.
///
/// Only construction can fail. Once an engine is running, every anomaly
/// degrades to the unsynchronized state instead of surfacing as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("facet count {0} outside 1..={max}", max = crate::MAX_FACETS)]
    FacetCount(usize),
    #[error("laser plane count {0} outside 1..={max}", max = crate::MAX_LASER_PLANES)]
    LaserPlanes(usize),
    #[error("facet map entry {entry} at facet {facet} is out of range or repeated")]
    FacetMapNotBijective { facet: usize, entry: u8 },
    #[error("frame rows must be at least one byte wide")]
    EmptyRow,
    #[error("plane stride {stride} is shorter than {facets} facet rows")]
    PlaneStride { stride: usize, facets: usize },
    #[error("lock and unlock counts must both be non-zero")]
    HysteresisCount,
    #[error("first facet {delay} ticks after sync does not clear the {tolerance} tick edge wait")]
    FirstFacetTooEarly { delay: u32, tolerance: u32 },
    #[error("delay map durations or counts are inverted")]
    DelayMapRange,
    #[error("frame needs {needed} bytes but holds {capacity}")]
    FrameTooSmall { needed: usize, capacity: usize },
}
