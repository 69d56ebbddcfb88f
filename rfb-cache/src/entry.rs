//! Cached rectangle entries.

use crate::error::CacheError;
use crate::key::QualityCode;
use rfb_pixelbuffer::PixelFormat;

/// One cached rectangle: canonical pixels plus identification metadata.
///
/// Pixels are kept in the canonical layout (32bpp, depth 24, little-endian,
/// zeroed padding byte), tightly packed row by row, so `stride_pixels`
/// equals `width` for entries built by the engines. The stride is recorded
/// in **pixels**, never bytes.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Canonical (lossless-layout) pixel bytes of the rectangle.
    pub pixels: Vec<u8>,

    /// Pixel format the pixels are stored in.
    pub format: PixelFormat,

    pub width: u16,
    pub height: u16,

    /// Row stride in pixels.
    pub stride_pixels: u16,

    /// Wall-clock seconds (engine-relative) of the last access. Used only
    /// for TTL checks and ordering tie-breaks.
    pub last_access: u32,

    /// Hash of the canonical pixel bytes.
    pub canonical_hash: u64,

    /// Hash of the pixels the viewer observes after decoding the
    /// transmitted payload. Equals `canonical_hash` for lossless encodings.
    pub actual_hash: u64,

    /// Quality descriptor used for best-available selection and upgrades.
    pub quality: QualityCode,

    /// Encoded payload, retained on the server when a later init response
    /// for the same key may be needed.
    pub encoded: Option<Vec<u8>>,
}

impl CacheEntry {
    /// Create a lossless entry from canonical pixels.
    pub fn new_lossless(
        pixels: Vec<u8>,
        width: u16,
        height: u16,
        canonical_hash: u64,
        now: u32,
    ) -> Self {
        Self {
            pixels,
            format: PixelFormat::canonical(),
            width,
            height,
            stride_pixels: width,
            last_access: now,
            canonical_hash,
            actual_hash: canonical_hash,
            quality: QualityCode::new(true, 32),
            encoded: None,
        }
    }

    /// Create a lossy entry: pixels are what the viewer will see after
    /// decode, identified by both the canonical and the actual hash.
    pub fn new_lossy(
        pixels: Vec<u8>,
        width: u16,
        height: u16,
        canonical_hash: u64,
        actual_hash: u64,
        now: u32,
    ) -> Self {
        Self {
            pixels,
            format: PixelFormat::canonical(),
            width,
            height,
            stride_pixels: width,
            last_access: now,
            canonical_hash,
            actual_hash,
            quality: QualityCode::new(false, 32),
            encoded: None,
        }
    }

    /// Resident byte footprint used for capacity accounting.
    pub fn bytes(&self) -> usize {
        self.pixels.len() + self.encoded.as_ref().map_or(0, |e| e.len())
    }

    /// An entry is lossless when both hashes agree and the quality code
    /// carries the lossless bit.
    pub fn is_lossless(&self) -> bool {
        self.canonical_hash == self.actual_hash && self.quality.is_lossless()
    }

    /// Mark the entry as accessed.
    pub fn touch(&mut self, now: u32) {
        self.last_access = now;
    }

    /// Check the structural invariants:
    /// `pixels.len() == height * stride_pixels * bytes_per_pixel` and
    /// `stride_pixels >= width`.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.stride_pixels < self.width {
            return Err(CacheError::NotHashable(format!(
                "stride {} pixels is narrower than width {}",
                self.stride_pixels, self.width
            )));
        }
        let expected = self.height as usize
            * self.stride_pixels as usize
            * self.format.bytes_per_pixel() as usize;
        if self.pixels.len() != expected {
            return Err(CacheError::PayloadLength {
                expected,
                actual: self.pixels.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_64x64() -> CacheEntry {
        CacheEntry::new_lossless(vec![0u8; 64 * 64 * 4], 64, 64, 0x1234, 0)
    }

    #[test]
    fn test_lossless_entry_invariants() {
        let e = entry_64x64();
        assert!(e.is_lossless());
        assert_eq!(e.canonical_hash, e.actual_hash);
        assert_eq!(e.stride_pixels, e.width);
        e.validate().unwrap();
    }

    #[test]
    fn test_lossy_entry() {
        let e = CacheEntry::new_lossy(vec![0u8; 16 * 16 * 4], 16, 16, 1, 2, 0);
        assert!(!e.is_lossless());
        assert_ne!(e.canonical_hash, e.actual_hash);
        e.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_short_pixels() {
        let mut e = entry_64x64();
        e.pixels.truncate(100);
        assert!(matches!(
            e.validate(),
            Err(CacheError::PayloadLength { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_narrow_stride() {
        let mut e = entry_64x64();
        e.stride_pixels = 32;
        assert!(e.validate().is_err());
    }

    #[test]
    fn test_bytes_includes_retained_encoding() {
        let mut e = entry_64x64();
        let base = e.bytes();
        e.encoded = Some(vec![0u8; 100]);
        assert_eq!(e.bytes(), base + 100);
    }

    #[test]
    fn test_touch_updates_access_time() {
        let mut e = entry_64x64();
        e.touch(42);
        assert_eq!(e.last_access, 42);
    }
}
