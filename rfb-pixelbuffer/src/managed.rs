//! Owned pixel buffer implementation.

use crate::{MutablePixelBuffer, PixelBuffer, PixelFormat};
use anyhow::{anyhow, Result};
use rfb_common::{Point, Rect};

/// A pixel buffer that manages its own memory.
///
/// Pixel data lives in a contiguous `Vec<u8>` in row-major order with no
/// padding between rows, so the stride in pixels always equals the width.
#[derive(Debug, Clone)]
pub struct ManagedPixelBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
    /// Stride in **pixels** (always equals width for this implementation).
    stride: usize,
}

impl ManagedPixelBuffer {
    /// Creates a new zero-filled buffer with the given dimensions and format.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let stride = width as usize;
        let bytes_per_pixel = format.bytes_per_pixel() as usize;
        let data = vec![0u8; stride * height as usize * bytes_per_pixel];

        Self {
            width,
            height,
            format,
            data,
            stride,
        }
    }

    /// Resizes the buffer. Existing pixel data is not preserved.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.stride = width as usize;
        let bytes_per_pixel = self.format.bytes_per_pixel() as usize;
        self.data.clear();
        self.data
            .resize(self.stride * height as usize * bytes_per_pixel, 0);
    }

    /// Returns the stride in pixels.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Returns the raw pixel data (row-major, tightly packed).
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn validate_rect(&self, rect: Rect) -> Result<()> {
        if rect.x < 0
            || rect.y < 0
            || rect.x as u32 + rect.width > self.width
            || rect.y as u32 + rect.height > self.height
        {
            return Err(anyhow!(
                "rectangle out of bounds: {:?} (buffer size: {}x{})",
                rect,
                self.width,
                self.height
            ));
        }
        Ok(())
    }
}

impl PixelBuffer for ManagedPixelBuffer {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn pixel_format(&self) -> &PixelFormat {
        &self.format
    }

    fn get_buffer(&self, rect: Rect, stride: &mut usize) -> Option<&[u8]> {
        if rect.is_empty() || self.validate_rect(rect).is_err() {
            return None;
        }

        *stride = self.stride;
        let bpp = self.format.bytes_per_pixel() as usize;
        let start = (rect.y as usize * self.stride + rect.x as usize) * bpp;
        // The last row only extends to the rectangle's right edge.
        let len = ((rect.height as usize - 1) * self.stride + rect.width as usize) * bpp;

        Some(&self.data[start..start + len])
    }
}

impl MutablePixelBuffer for ManagedPixelBuffer {
    fn get_buffer_rw(&mut self, rect: Rect, stride: &mut usize) -> Option<&mut [u8]> {
        if rect.is_empty() || self.validate_rect(rect).is_err() {
            return None;
        }

        *stride = self.stride;
        let bpp = self.format.bytes_per_pixel() as usize;
        let start = (rect.y as usize * self.stride + rect.x as usize) * bpp;
        let len = ((rect.height as usize - 1) * self.stride + rect.width as usize) * bpp;

        Some(&mut self.data[start..start + len])
    }

    fn commit_buffer(&mut self, _rect: Rect) {
        // Direct storage; nothing to flush.
    }

    fn fill_rect(&mut self, rect: Rect, pixel: &[u8]) -> Result<()> {
        self.validate_rect(rect)?;

        let bpp = self.format.bytes_per_pixel() as usize;
        if pixel.len() != bpp {
            return Err(anyhow!(
                "invalid pixel size: got {} bytes, expected {}",
                pixel.len(),
                bpp
            ));
        }

        for y in 0..rect.height as usize {
            let row_start = ((rect.y as usize + y) * self.stride + rect.x as usize) * bpp;
            let row = &mut self.data[row_start..row_start + rect.width as usize * bpp];
            for px in row.chunks_exact_mut(bpp) {
                px.copy_from_slice(pixel);
            }
        }
        Ok(())
    }

    fn copy_rect(&mut self, dest: Rect, src_offset: Point) -> Result<()> {
        self.validate_rect(dest)?;
        let src = Rect::new(
            dest.x + src_offset.x,
            dest.y + src_offset.y,
            dest.width,
            dest.height,
        );
        self.validate_rect(src)?;

        let bpp = self.format.bytes_per_pixel() as usize;
        let row_bytes = dest.width as usize * bpp;

        // Copy top-down or bottom-up so overlapping regions stay intact.
        let rows: Vec<usize> = if src.y >= dest.y {
            (0..dest.height as usize).collect()
        } else {
            (0..dest.height as usize).rev().collect()
        };

        for y in rows {
            let src_start = ((src.y as usize + y) * self.stride + src.x as usize) * bpp;
            let dst_start = ((dest.y as usize + y) * self.stride + dest.x as usize) * bpp;
            self.data
                .copy_within(src_start..src_start + row_bytes, dst_start);
        }
        Ok(())
    }

    fn image_rect(&mut self, dest: Rect, pixels: &[u8], stride: usize) -> Result<()> {
        self.validate_rect(dest)?;

        let bpp = self.format.bytes_per_pixel() as usize;
        let src_stride = if stride == 0 {
            dest.width as usize
        } else {
            stride
        };
        if src_stride < dest.width as usize {
            return Err(anyhow!(
                "source stride {} pixels is narrower than rectangle width {}",
                src_stride,
                dest.width
            ));
        }

        let row_bytes = dest.width as usize * bpp;
        let needed = ((dest.height as usize - 1) * src_stride + dest.width as usize) * bpp;
        if pixels.len() < needed {
            return Err(anyhow!(
                "source data too short: {} bytes, need {}",
                pixels.len(),
                needed
            ));
        }

        for y in 0..dest.height as usize {
            let src_start = y * src_stride * bpp;
            let dst_start = ((dest.y as usize + y) * self.stride + dest.x as usize) * bpp;
            self.data[dst_start..dst_start + row_bytes]
                .copy_from_slice(&pixels[src_start..src_start + row_bytes]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_buffer_is_zeroed() {
        let buffer = ManagedPixelBuffer::new(8, 4, PixelFormat::canonical());
        assert_eq!(buffer.dimensions(), (8, 4));
        assert_eq!(buffer.stride(), 8);
        assert!(buffer.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_fill_and_read_back() {
        let mut buffer = ManagedPixelBuffer::new(16, 16, PixelFormat::canonical());
        let red = PixelFormat::canonical().from_rgb888([255, 0, 0, 255]);
        buffer.fill_rect(Rect::new(4, 4, 8, 8), &red).unwrap();

        let mut stride = 0;
        let pixels = buffer.get_buffer(Rect::new(4, 4, 8, 8), &mut stride).unwrap();
        assert_eq!(stride, 16);
        assert_eq!(&pixels[0..4], red.as_slice());
    }

    #[test]
    fn test_image_rect_tightly_packed() {
        let mut buffer = ManagedPixelBuffer::new(4, 4, PixelFormat::canonical());
        let data = vec![0xABu8; 2 * 2 * 4];
        buffer.image_rect(Rect::new(1, 1, 2, 2), &data, 0).unwrap();

        let mut stride = 0;
        let pixels = buffer.get_buffer(Rect::new(1, 1, 2, 2), &mut stride).unwrap();
        assert_eq!(&pixels[0..8], &data[0..8]);
    }

    #[test]
    fn test_image_rect_rejects_short_data() {
        let mut buffer = ManagedPixelBuffer::new(4, 4, PixelFormat::canonical());
        let data = vec![0u8; 7];
        assert!(buffer.image_rect(Rect::new(0, 0, 2, 2), &data, 0).is_err());
    }

    #[test]
    fn test_copy_rect_overlapping() {
        let mut buffer = ManagedPixelBuffer::new(4, 1, PixelFormat::canonical());
        let mut stride = 0;
        {
            let data = buffer.get_buffer_rw(Rect::new(0, 0, 4, 1), &mut stride).unwrap();
            for (i, b) in data.iter_mut().enumerate() {
                *b = i as u8;
            }
        }
        // Shift right by one pixel; source overlaps destination.
        buffer
            .copy_rect(Rect::new(1, 0, 3, 1), Point::new(-1, 0))
            .unwrap();
        let pixels = buffer.get_buffer(Rect::new(1, 0, 3, 1), &mut stride).unwrap();
        assert_eq!(&pixels[0..4], &[0, 1, 2, 3]);
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let buffer = ManagedPixelBuffer::new(4, 4, PixelFormat::canonical());
        let mut stride = 0;
        assert!(buffer.get_buffer(Rect::new(2, 2, 4, 4), &mut stride).is_none());
        assert!(buffer.get_buffer(Rect::new(-1, 0, 2, 2), &mut stride).is_none());
    }

    #[test]
    fn test_canonical_rect_helper() {
        let mut buffer = ManagedPixelBuffer::new(4, 4, PixelFormat::canonical());
        let pixel = [0xCC, 0xBB, 0xAA, 0x00];
        buffer.fill_rect(Rect::new(0, 0, 4, 4), &pixel).unwrap();

        let canon = buffer.canonical_rect(Rect::new(1, 1, 2, 2)).unwrap();
        assert_eq!(canon.len(), 2 * 2 * 4);
        for px in canon.chunks_exact(4) {
            assert_eq!(px, &[0xCC, 0xBB, 0xAA, 0x00]);
        }
    }
}
