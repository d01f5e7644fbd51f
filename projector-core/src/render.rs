//! Bit-banged horizontal scan.
//!
//! Columns are walked from the rightmost byte to the leftmost, each byte
//! from bit 7 down to bit 0, which matches the direction the beam sweeps
//! across the field. Pixel pitch comes from busy-wait counts, not from the
//! clock: a clock read costs more than one pixel.

use crate::config::FacetMap;
use crate::frame::RasterSource;
use crate::MAX_LASER_PLANES;

/// Output side of the scan: laser lines plus a calibrated spin loop.
pub trait LaserDriver {
    /// Drive every laser line at once. Bit `p` of `levels` is plane `p`.
    fn set_lasers(&mut self, levels: u8);

    /// Spin for `count` iterations of the calibrated delay loop.
    fn hold(&mut self, count: u16);
}

/// Paint physical facet `facet`, reading the row the facet map assigns to it.
pub fn render_facet<S, L>(
    source: &S,
    map: &FacetMap,
    facet: usize,
    planes: usize,
    byte_delay: u16,
    bit_delay: u16,
    lasers: &mut L,
) where
    S: RasterSource + ?Sized,
    L: LaserDriver + ?Sized,
{
    render_row(
        source,
        map.raster_row(facet),
        planes,
        byte_delay,
        bit_delay,
        lasers,
    );
}

/// Paint one raster row across all planes, then force every line off.
pub fn render_row<S, L>(
    source: &S,
    raster_row: usize,
    planes: usize,
    byte_delay: u16,
    bit_delay: u16,
    lasers: &mut L,
) where
    S: RasterSource + ?Sized,
    L: LaserDriver + ?Sized,
{
    let planes = planes.clamp(1, MAX_LASER_PLANES);
    let mut rows: [&[u8]; MAX_LASER_PLANES] = [&[]; MAX_LASER_PLANES];
    for (plane, row) in rows.iter_mut().enumerate().take(planes) {
        *row = source.row(plane, raster_row);
    }
    let columns = rows[..planes].iter().map(|r| r.len()).min().unwrap_or(0);

    for column in (0..columns).rev() {
        let mut bytes = [0u8; MAX_LASER_PLANES];
        for plane in 0..planes {
            bytes[plane] = rows[plane][column];
        }

        for bit in (0..8).rev() {
            let mut levels = 0u8;
            for (plane, byte) in bytes.iter().enumerate().take(planes) {
                levels |= ((byte >> bit) & 1) << plane;
            }
            lasers.set_lasers(levels);
            if bit != 0 {
                lasers.hold(bit_delay);
            }
        }
        lasers.hold(byte_delay);
    }

    lasers.set_lasers(0);
}
