//! Pixel buffer traits.
//!
//! Two traits cover buffer access:
//!
//! - [`PixelBuffer`]: read-only access to pixel data
//! - [`MutablePixelBuffer`]: read-write access with rendering operations
//!
//! # Stride convention
//!
//! All stride values are in **pixels**, never bytes:
//!
//! ```text
//! byte_offset = (y * stride + x) * bytes_per_pixel
//! byte_length = height * stride * bytes_per_pixel
//! ```

use crate::PixelFormat;
use anyhow::Result;
use rfb_common::{Point, Rect};

/// Read-only pixel buffer access.
///
/// The returned slice from [`get_buffer`](Self::get_buffer) may span more
/// than the requested rectangle; use the reported stride to walk rows.
pub trait PixelBuffer {
    /// Returns the dimensions of the pixel buffer as (width, height).
    fn dimensions(&self) -> (u32, u32);

    /// Returns the pixel format used by this buffer.
    fn pixel_format(&self) -> &PixelFormat;

    /// Gets read-only access to a rectangular region of pixel data.
    ///
    /// `stride` receives the row stride in **pixels**. Returns `None` if the
    /// rectangle is out of bounds.
    fn get_buffer(&self, rect: Rect, stride: &mut usize) -> Option<&[u8]>;

    /// Extract a rectangle as tightly packed canonical bytes.
    ///
    /// Convenience over [`get_buffer`](Self::get_buffer) plus
    /// [`PixelFormat::canonicalize_rect`]; this is the pixel source the
    /// content hasher consumes.
    fn canonical_rect(&self, rect: Rect) -> Result<Vec<u8>> {
        let mut stride = 0usize;
        let pixels = self
            .get_buffer(rect, &mut stride)
            .ok_or_else(|| anyhow::anyhow!("rectangle {:?} out of bounds", rect))?;
        self.pixel_format().canonicalize_rect(
            pixels,
            rect.width as usize,
            rect.height as usize,
            stride,
        )
    }
}

/// Mutable pixel buffer with rendering operations.
///
/// For direct manipulation call [`get_buffer_rw`](Self::get_buffer_rw),
/// modify the data, then [`commit_buffer`](Self::commit_buffer). For common
/// operations use [`fill_rect`](Self::fill_rect),
/// [`copy_rect`](Self::copy_rect) or [`image_rect`](Self::image_rect).
pub trait MutablePixelBuffer: PixelBuffer {
    /// Gets read-write access to a rectangular region.
    ///
    /// `stride` receives the row stride in **pixels**. Changes must be
    /// finalized with [`commit_buffer`](Self::commit_buffer).
    fn get_buffer_rw(&mut self, rect: Rect, stride: &mut usize) -> Option<&mut [u8]>;

    /// Commits changes made via [`get_buffer_rw`](Self::get_buffer_rw).
    fn commit_buffer(&mut self, rect: Rect);

    /// Fills a rectangle with a solid colour. `pixel` must be exactly one
    /// pixel in this buffer's format.
    fn fill_rect(&mut self, rect: Rect, pixel: &[u8]) -> Result<()>;

    /// Copies a rectangle within the buffer. `src_offset` is the offset from
    /// `dest` to the source position; overlapping regions are handled.
    fn copy_rect(&mut self, dest: Rect, src_offset: Point) -> Result<()>;

    /// Copies external image data into a rectangle.
    ///
    /// `stride` is the source stride in **pixels**; 0 means tightly packed.
    fn image_rect(&mut self, dest: Rect, pixels: &[u8], stride: usize) -> Result<()>;
}
