//! One-bit frame buffer the lasers paint from.
//!
//! Rows are packed MSB first, row-major. With several laser planes each
//! plane owns a block of rows starting `plane_stride` rows after the
//! previous one. The scan side only ever reads whole rows; drawing is left
//! to `embedded-graphics` (behind the `graphics` feature).

use crate::config::RigConfig;
use crate::error::ConfigError;

/// Read access the renderer needs: one row of one plane.
pub trait RasterSource {
    fn row(&self, plane: usize, raster_row: usize) -> &[u8];
}

/// Fixed-capacity frame buffer. `N` is the backing size in bytes; the
/// geometry actually used is chosen at runtime.
#[derive(Clone)]
pub struct FrameBuffer<const N: usize> {
    bytes: [u8; N],
    row_bytes: usize,
    rows: usize,
    plane_stride: usize,
}

impl<const N: usize> FrameBuffer<N> {
    pub fn new(row_bytes: usize, rows: usize, plane_stride: usize) -> Result<Self, ConfigError> {
        if row_bytes == 0 {
            return Err(ConfigError::EmptyRow);
        }
        let needed = row_bytes * rows;
        if needed > N {
            return Err(ConfigError::FrameTooSmall {
                needed,
                capacity: N,
            });
        }
        Ok(Self {
            bytes: [0; N],
            row_bytes,
            rows,
            plane_stride,
        })
    }

    /// Buffer shaped for `config`.
    pub fn for_rig(config: &RigConfig) -> Result<Self, ConfigError> {
        Self::new(config.row_bytes, config.rows_needed(), config.plane_stride)
    }

    pub fn row_bytes(&self) -> usize {
        self.row_bytes
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn width(&self) -> usize {
        self.row_bytes * 8
    }

    pub fn clear(&mut self) {
        self.bytes.fill(0);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.row_bytes * self.rows]
    }

    /// Row `row` counted from the top of the whole buffer.
    pub fn row_mut(&mut self, row: usize) -> &mut [u8] {
        let start = row * self.row_bytes;
        &mut self.bytes[start..start + self.row_bytes]
    }

    pub fn pixel(&self, x: usize, y: usize) -> bool {
        if x >= self.width() || y >= self.rows {
            return false;
        }
        self.bytes[y * self.row_bytes + x / 8] & (0x80 >> (x % 8)) != 0
    }

    pub fn set_pixel(&mut self, x: usize, y: usize, on: bool) {
        if x >= self.width() || y >= self.rows {
            return;
        }
        let byte = &mut self.bytes[y * self.row_bytes + x / 8];
        let mask = 0x80 >> (x % 8);
        if on {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }
}

impl<const N: usize> RasterSource for FrameBuffer<N> {
    fn row(&self, plane: usize, raster_row: usize) -> &[u8] {
        let row = plane * self.plane_stride + raster_row;
        if row >= self.rows {
            return &[];
        }
        let start = row * self.row_bytes;
        &self.bytes[start..start + self.row_bytes]
    }
}

#[cfg(feature = "graphics")]
pub use graphics::draw_test_card;

#[cfg(feature = "graphics")]
mod graphics {
    use core::convert::Infallible;

    use embedded_graphics::mono_font::ascii::FONT_4X6;
    use embedded_graphics::mono_font::MonoTextStyle;
    use embedded_graphics::pixelcolor::BinaryColor;
    use embedded_graphics::prelude::*;
    use embedded_graphics::primitives::PrimitiveStyle;
    use embedded_graphics::text::{Baseline, Text};

    use super::FrameBuffer;

    /// Alignment card: a one-pixel border around `text` in the 4x6 font.
    /// Eight rows are enough to fit both.
    pub fn draw_test_card<D>(target: &mut D, text: &str) -> Result<(), D::Error>
    where
        D: DrawTarget<Color = BinaryColor> + OriginDimensions,
    {
        target.clear(BinaryColor::Off)?;
        target
            .bounding_box()
            .into_styled(PrimitiveStyle::with_stroke(BinaryColor::On, 1))
            .draw(target)?;
        Text::with_baseline(
            text,
            Point::new(2, 1),
            MonoTextStyle::new(&FONT_4X6, BinaryColor::On),
            Baseline::Top,
        )
        .draw(target)?;
        Ok(())
    }

    impl<const N: usize> OriginDimensions for FrameBuffer<N> {
        fn size(&self) -> Size {
            Size::new(self.width() as u32, self.rows() as u32)
        }
    }

    impl<const N: usize> DrawTarget for FrameBuffer<N> {
        type Color = BinaryColor;
        type Error = Infallible;

        fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
        where
            I: IntoIterator<Item = Pixel<Self::Color>>,
        {
            for Pixel(point, color) in pixels {
                if point.x < 0 || point.y < 0 {
                    continue;
                }
                self.set_pixel(point.x as usize, point.y as usize, color.is_on());
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_pixels_msb_first() {
        let mut frame = FrameBuffer::<16>::new(2, 8, 8).unwrap();
        frame.set_pixel(0, 1, true);
        frame.set_pixel(9, 1, true);
        assert_eq!(frame.row(0, 1), &[0x80, 0x40]);
        assert!(frame.pixel(9, 1));
        frame.set_pixel(0, 1, false);
        assert_eq!(frame.row(0, 1), &[0x00, 0x40]);
    }

    #[test]
    fn planes_start_one_stride_apart() {
        let mut frame = FrameBuffer::<32>::new(1, 20, 10).unwrap();
        frame.row_mut(3)[0] = 0xAA;
        frame.row_mut(13)[0] = 0x55;
        assert_eq!(frame.row(0, 3), &[0xAA]);
        assert_eq!(frame.row(1, 3), &[0x55]);
    }

    #[test]
    fn out_of_range_access_is_harmless() {
        let mut frame = FrameBuffer::<8>::new(1, 8, 8).unwrap();
        frame.set_pixel(8, 0, true);
        frame.set_pixel(0, 8, true);
        assert!(frame.as_bytes().iter().all(|&b| b == 0));
        assert!(frame.row(1, 0).is_empty());
    }

    #[test]
    fn rejects_geometry_larger_than_backing() {
        assert_eq!(
            FrameBuffer::<16>::new(4, 8, 8).err(),
            Some(ConfigError::FrameTooSmall {
                needed: 32,
                capacity: 16
            })
        );
    }

    #[cfg(feature = "graphics")]
    #[test]
    fn test_card_frames_the_buffer() {
        let mut frame = FrameBuffer::<64>::new(8, 8, 8).unwrap();
        draw_test_card(&mut frame, "A").unwrap();

        assert!(frame.row(0, 0).iter().all(|&b| b == 0xFF));
        assert!(frame.row(0, 7).iter().all(|&b| b == 0xFF));
        for y in 1..7 {
            assert!(frame.pixel(0, y));
            assert!(frame.pixel(63, y));
        }
        // Glyph pixels land inside the border.
        let inner = (1..7).any(|y| (2..6).any(|x| frame.pixel(x, y)));
        assert!(inner);
    }
}
