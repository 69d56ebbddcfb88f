//! Deterministic content hashing of canonical pixel streams.
//!
//! Two algorithms over the same canonical byte stream (see
//! [`rfb_pixelbuffer::PixelFormat::canonicalize_rect`]):
//!
//! - a fast 64-bit XXH64 hash identifying content within one session, and
//! - a 16-byte hash (leading bytes of SHA-256) identifying content across
//!   sessions in the persistent cache.
//!
//! Both are bit-stable across machines, builds, and endianness because the
//! canonical stream itself is: little-endian truecolour with a zeroed
//! padding byte, tightly packed row by row. Rectangle dimensions are *not*
//! fed into the digest; they live in the composite cache key.
//!
//! Rectangles at or above a configurable area are hashed from a sampled
//! sub-grid (every Nth pixel in both dimensions) as a bandwidth/latency
//! knob. Sampling must be configured identically on server and viewer.

use crate::config::HashConfig;
use rfb_common::Rect;
use rfb_pixelbuffer::PixelBuffer;
use sha2::{Digest, Sha256};
use std::hash::Hasher as _;
use twox_hash::XxHash64;

/// Sentinel for "this rectangle could not be hashed; do not cache it".
pub const NULL_HASH: u64 = 0;

/// Session-level hash of an already-canonical byte stream: XXH64 with a
/// computed 0 remapped to 1 so the null sentinel stays unambiguous.
///
/// This is the single definition of the algorithm. The unsampled path of
/// [`ContentHasher::hash_canonical`] goes through it, and the persistent
/// store validates hydrated payloads with it, so the two sides can never
/// drift.
pub fn stream_hash(canonical: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(canonical);
    let digest = hasher.finish();
    if digest == NULL_HASH {
        1
    } else {
        digest
    }
}

/// Hashes canonical pixel streams into cache identifiers.
#[derive(Debug, Clone)]
pub struct ContentHasher {
    /// Rectangles with `area >= sample_area_threshold` use the sampled path.
    sample_area_threshold: u64,
    /// Sampling step in pixels, applied in both dimensions.
    sample_stride: usize,
}

impl ContentHasher {
    pub fn new(sample_area_threshold: u64, sample_stride: usize) -> Self {
        Self {
            sample_area_threshold,
            sample_stride: sample_stride.max(1),
        }
    }

    pub fn from_config(config: &HashConfig) -> Self {
        Self::new(config.sample_area_threshold, config.sample_stride)
    }

    /// A hasher that never samples, for byte-exact round-trip contexts.
    pub fn unsampled() -> Self {
        Self::new(u64::MAX, 1)
    }

    fn is_sampled(&self, area: u64) -> bool {
        area >= self.sample_area_threshold
    }

    /// Hash a rectangle of a pixel buffer. Returns [`NULL_HASH`] when the
    /// rectangle cannot be canonicalized (empty, out of bounds, unsupported
    /// format); callers treat that as "not cacheable".
    pub fn hash_rect(&self, pb: &dyn PixelBuffer, rect: Rect) -> u64 {
        match pb.canonical_rect(rect) {
            Ok(canonical) => self.hash_canonical(&canonical, rect.width, rect.height),
            Err(err) => {
                tracing::warn!("rectangle {:?} not hashable: {}", rect, err);
                NULL_HASH
            }
        }
    }

    /// Hash an already-canonicalized byte stream.
    ///
    /// `canonical` must be exactly `width * height * 4` bytes (the
    /// canonicalization step has already consumed
    /// `height * stride_pixels * bytes_per_pixel` source bytes and stripped
    /// the stride padding).
    pub fn hash_canonical(&self, canonical: &[u8], width: u32, height: u32) -> u64 {
        if width == 0 || height == 0 {
            return NULL_HASH;
        }
        let expected = width as usize * height as usize * 4;
        if canonical.len() != expected {
            tracing::warn!(
                "canonical stream is {} bytes, expected {} for {}x{}",
                canonical.len(),
                expected,
                width,
                height
            );
            return NULL_HASH;
        }

        if !self.is_sampled(width as u64 * height as u64) {
            return stream_hash(canonical);
        }

        let mut hasher = XxHash64::with_seed(0);
        self.feed(&mut |bytes| hasher.write(bytes), canonical, width, height);
        let digest = hasher.finish();
        if digest == NULL_HASH {
            1
        } else {
            digest
        }
    }

    /// 16-byte persistent hash of a rectangle. `None` when not hashable.
    pub fn persistent_hash_rect(&self, pb: &dyn PixelBuffer, rect: Rect) -> Option<[u8; 16]> {
        let canonical = pb.canonical_rect(rect).ok()?;
        self.persistent_hash_canonical(&canonical, rect.width, rect.height)
    }

    /// 16-byte persistent hash of an already-canonicalized byte stream:
    /// the leading 16 bytes of SHA-256 over the same (possibly sampled)
    /// stream the session hash reads.
    pub fn persistent_hash_canonical(
        &self,
        canonical: &[u8],
        width: u32,
        height: u32,
    ) -> Option<[u8; 16]> {
        if width == 0 || height == 0 {
            return None;
        }
        if canonical.len() != width as usize * height as usize * 4 {
            return None;
        }

        let mut digest = Sha256::new();
        self.feed(&mut |bytes| digest.update(bytes), canonical, width, height);
        let full = digest.finalize();

        let mut out = [0u8; 16];
        out.copy_from_slice(&full[..16]);
        Some(out)
    }

    /// Feed either the full stream or the sampled sub-grid to `sink`.
    fn feed(&self, sink: &mut dyn FnMut(&[u8]), canonical: &[u8], width: u32, height: u32) {
        let area = width as u64 * height as u64;
        if !self.is_sampled(area) {
            sink(canonical);
            return;
        }

        let w = width as usize;
        let step = self.sample_stride;
        for y in (0..height as usize).step_by(step) {
            for x in (0..w).step_by(step) {
                let off = (y * w + x) * 4;
                sink(&canonical[off..off + 4]);
            }
        }
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::from_config(&HashConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfb_pixelbuffer::{ManagedPixelBuffer, MutablePixelBuffer, PixelFormat};

    fn canonical_fill(width: u32, height: u32, pixel: [u8; 4]) -> Vec<u8> {
        let mut v = Vec::with_capacity((width * height * 4) as usize);
        for _ in 0..width * height {
            v.extend_from_slice(&pixel);
        }
        v
    }

    #[test]
    fn test_deterministic_across_runs() {
        let hasher = ContentHasher::unsampled();
        let data = canonical_fill(64, 64, [0xAA, 0xAA, 0xAA, 0x00]);
        let h1 = hasher.hash_canonical(&data, 64, 64);
        let h2 = hasher.hash_canonical(&data, 64, 64);
        assert_eq!(h1, h2);
        assert_ne!(h1, NULL_HASH);
    }

    #[test]
    fn test_different_content_different_hash() {
        let hasher = ContentHasher::unsampled();
        let a = canonical_fill(8, 8, [1, 2, 3, 0]);
        let b = canonical_fill(8, 8, [1, 2, 4, 0]);
        assert_ne!(
            hasher.hash_canonical(&a, 8, 8),
            hasher.hash_canonical(&b, 8, 8)
        );
    }

    #[test]
    fn test_dimensions_not_part_of_digest() {
        // Identical byte streams under different geometries hash the same;
        // the composite key is what separates them.
        let hasher = ContentHasher::unsampled();
        let data = canonical_fill(8, 2, [9, 9, 9, 0]);
        assert_eq!(
            hasher.hash_canonical(&data, 8, 2),
            hasher.hash_canonical(&data, 4, 4)
        );
    }

    #[test]
    fn test_zero_dimensions_yield_null_hash() {
        let hasher = ContentHasher::unsampled();
        assert_eq!(hasher.hash_canonical(&[], 0, 4), NULL_HASH);
        assert_eq!(hasher.hash_canonical(&[], 4, 0), NULL_HASH);
        assert!(hasher.persistent_hash_canonical(&[], 0, 4).is_none());
    }

    #[test]
    fn test_length_mismatch_yields_null_hash() {
        let hasher = ContentHasher::unsampled();
        let data = vec![0u8; 63]; // one byte short of 4x4
        assert_eq!(hasher.hash_canonical(&data, 4, 4), NULL_HASH);
    }

    #[test]
    fn test_hash_rect_reads_full_stride() {
        // A rectangle inside a wider buffer must hash identically to the
        // same pixels in a tight buffer; getting this wrong means the
        // stride was misused as a byte count.
        let hasher = ContentHasher::unsampled();
        let pf = PixelFormat::canonical();
        let pixel = pf.from_rgb888([10, 20, 30, 255]);

        let mut wide = ManagedPixelBuffer::new(100, 50, pf);
        wide.fill_rect(rfb_common::Rect::new(0, 0, 100, 50), &pixel)
            .unwrap();
        let mut tight = ManagedPixelBuffer::new(16, 16, pf);
        tight
            .fill_rect(rfb_common::Rect::new(0, 0, 16, 16), &pixel)
            .unwrap();

        let h_wide = hasher.hash_rect(&wide, rfb_common::Rect::new(10, 10, 16, 16));
        let h_tight = hasher.hash_rect(&tight, rfb_common::Rect::new(0, 0, 16, 16));
        assert_eq!(h_wide, h_tight);
        assert_ne!(h_wide, NULL_HASH);
    }

    #[test]
    fn test_out_of_bounds_rect_yields_null_hash() {
        let hasher = ContentHasher::unsampled();
        let buffer = ManagedPixelBuffer::new(8, 8, PixelFormat::canonical());
        assert_eq!(
            hasher.hash_rect(&buffer, rfb_common::Rect::new(4, 4, 8, 8)),
            NULL_HASH
        );
    }

    #[test]
    fn test_sampling_threshold_boundary() {
        // 16x16 = 256 pixels. Threshold 256: exactly at the threshold uses
        // the sampled path, one pixel fewer uses the full path.
        let hasher = ContentHasher::new(256, 4);

        // Two streams differing only at a pixel the 4-stride grid skips.
        let mut a = canonical_fill(16, 16, [5, 5, 5, 0]);
        let mut b = a.clone();
        let off = (1 * 16 + 1) * 4; // (1,1) is not on the sample grid
        b[off] ^= 0xFF;

        assert_eq!(hasher.hash_canonical(&a, 16, 16), hasher.hash_canonical(&b, 16, 16));

        // One pixel smaller area (16x15 = 240 < 256): full path sees the
        // difference.
        a.truncate(16 * 15 * 4);
        b.truncate(16 * 15 * 4);
        assert_ne!(
            hasher.hash_canonical(&a, 16, 15),
            hasher.hash_canonical(&b, 16, 15)
        );
    }

    #[test]
    fn test_sampled_and_full_agree_on_grid_pixels() {
        // Changing a pixel on the sample grid changes the sampled hash too.
        let hasher = ContentHasher::new(256, 4);
        let a = canonical_fill(16, 16, [5, 5, 5, 0]);
        let mut b = a.clone();
        let off = (4 * 16 + 8) * 4; // (8,4) is on the 4-stride grid
        b[off] ^= 0xFF;
        assert_ne!(
            hasher.hash_canonical(&a, 16, 16),
            hasher.hash_canonical(&b, 16, 16)
        );
    }

    #[test]
    fn test_stream_hash_matches_unsampled_rect_hash() {
        let hasher = ContentHasher::unsampled();
        let data = canonical_fill(16, 16, [4, 5, 6, 0]);
        assert_eq!(stream_hash(&data), hasher.hash_canonical(&data, 16, 16));
        assert_ne!(stream_hash(&data), NULL_HASH);
    }

    #[test]
    fn test_persistent_hash_stable_and_distinct() {
        let hasher = ContentHasher::unsampled();
        let a = canonical_fill(8, 8, [1, 1, 1, 0]);
        let b = canonical_fill(8, 8, [2, 2, 2, 0]);

        let ha = hasher.persistent_hash_canonical(&a, 8, 8).unwrap();
        let ha2 = hasher.persistent_hash_canonical(&a, 8, 8).unwrap();
        let hb = hasher.persistent_hash_canonical(&b, 8, 8).unwrap();

        assert_eq!(ha, ha2);
        assert_ne!(ha, hb);
        assert_ne!(ha, [0u8; 16]);
    }
}
