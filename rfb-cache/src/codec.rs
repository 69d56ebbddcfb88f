//! Inner codecs for cache init payloads.
//!
//! The cache treats pixel encoders as opaque: it needs `encode` to produce
//! the byte blob an init message carries and `decode` to reproduce the
//! pixels the viewer will see. The set of codecs is small and closed, so it
//! is an enum rather than a trait hierarchy.
//!
//! Codecs operate on canonical pixel streams (see
//! [`rfb_pixelbuffer::PixelFormat::canonicalize_rect`]) on both sides. This
//! keeps the server's lossy round-trip hash (`decode(encode(x))`) computed
//! over exactly the bytes the viewer will store, independent of the
//! session's negotiated pixel format.

use crate::error::CacheError;
use anyhow::{anyhow, Context};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use rfb_protocol::messages::types::{ENCODING_RAW, ENCODING_TIGHT, ENCODING_ZLIB};
use std::io::{Read, Write};

/// A concrete inner codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Canonical bytes as-is.
    Raw,
    /// Zlib-compressed canonical bytes.
    Zlib { level: u32 },
    /// JPEG-compressed pixels (rides the Tight encoding id). Lossy.
    Jpeg { quality: u8 },
}

impl Codec {
    /// The wire encoding identifier carried in init messages.
    pub fn encoding_id(&self) -> i32 {
        match self {
            Codec::Raw => ENCODING_RAW,
            Codec::Zlib { .. } => ENCODING_ZLIB,
            Codec::Jpeg { .. } => ENCODING_TIGHT,
        }
    }

    /// Resolve an inner encoding id received on the wire.
    pub fn from_encoding_id(id: i32) -> Option<Self> {
        match id {
            ENCODING_RAW => Some(Codec::Raw),
            ENCODING_ZLIB => Some(Codec::Zlib { level: 6 }),
            ENCODING_TIGHT => Some(Codec::Jpeg { quality: 80 }),
            _ => None,
        }
    }

    /// Whether decoding the encoded payload can differ from the input.
    pub fn is_lossy(&self) -> bool {
        matches!(self, Codec::Jpeg { .. })
    }

    /// Encode a canonical pixel stream into a payload blob.
    pub fn encode(
        &self,
        canonical: &[u8],
        width: u16,
        height: u16,
    ) -> Result<Vec<u8>, CacheError> {
        let expected = width as usize * height as usize * 4;
        if canonical.len() != expected {
            return Err(CacheError::PayloadLength {
                expected,
                actual: canonical.len(),
            });
        }

        match self {
            Codec::Raw => Ok(canonical.to_vec()),
            Codec::Zlib { level } => {
                let mut encoder =
                    ZlibEncoder::new(Vec::new(), Compression::new((*level).min(9)));
                encoder
                    .write_all(canonical)
                    .context("zlib compression failed")?;
                Ok(encoder.finish().context("zlib finish failed")?)
            }
            Codec::Jpeg { quality } => {
                let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
                for px in canonical.chunks_exact(4) {
                    rgb.extend_from_slice(&[px[2], px[1], px[0]]);
                }
                let mut out = Vec::new();
                let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(
                    &mut out,
                    (*quality).clamp(1, 100),
                );
                encoder
                    .encode(&rgb, width as u32, height as u32, image::ColorType::Rgb8)
                    .context("jpeg encoding failed")?;
                Ok(out)
            }
        }
    }

    /// Decode a payload blob back into a canonical pixel stream.
    ///
    /// The output is always exactly `width * height * 4` bytes with the
    /// padding byte zeroed; a payload that decodes to anything else is an
    /// error and the rectangle is dropped by the caller.
    pub fn decode(
        &self,
        payload: &[u8],
        width: u16,
        height: u16,
    ) -> Result<Vec<u8>, CacheError> {
        let expected = width as usize * height as usize * 4;

        let mut canonical = match self {
            Codec::Raw => {
                if payload.len() != expected {
                    return Err(CacheError::PayloadLength {
                        expected,
                        actual: payload.len(),
                    });
                }
                payload.to_vec()
            }
            Codec::Zlib { .. } => {
                let mut decoder = ZlibDecoder::new(payload);
                let mut out = Vec::with_capacity(expected);
                // Read one byte past the expected length so an over-long
                // stream is detected rather than silently truncated.
                decoder
                    .by_ref()
                    .take(expected as u64 + 1)
                    .read_to_end(&mut out)
                    .context("zlib decompression failed")?;
                if out.len() != expected {
                    return Err(CacheError::PayloadLength {
                        expected,
                        actual: out.len(),
                    });
                }
                out
            }
            Codec::Jpeg { .. } => {
                let img = image::load_from_memory_with_format(payload, image::ImageFormat::Jpeg)
                    .context("jpeg decoding failed")?;
                let rgb = img.to_rgb8();
                if rgb.width() != width as u32 || rgb.height() != height as u32 {
                    return Err(CacheError::Codec(anyhow!(
                        "jpeg decoded to {}x{}, rectangle is {}x{}",
                        rgb.width(),
                        rgb.height(),
                        width,
                        height
                    )));
                }
                let mut out = Vec::with_capacity(expected);
                for px in rgb.pixels() {
                    out.extend_from_slice(&[px[2], px[1], px[0], 0]);
                }
                out
            }
        };

        // Canonical streams carry a zeroed padding byte; enforce it on the
        // lossless paths too so hashing stays bit-stable whatever the peer
        // put there.
        for i in (3..canonical.len()).step_by(4) {
            canonical[i] = 0;
        }

        Ok(canonical)
    }
}
