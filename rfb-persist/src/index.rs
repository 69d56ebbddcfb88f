//! Versioned binary index for the persistent cache.
//!
//! `index.dat` maps 16-byte canonical hashes to `(shard, offset, size)`
//! payload locations plus the entry metadata needed to rebuild the
//! in-memory tables without touching any payload bytes.
//!
//! # File layout
//!
//! - magic `RCCI` (4 bytes)
//! - version (u32, big-endian; current 2)
//! - entry count (u32)
//! - reserved (u32, zero)
//! - entry table
//! - trailing SHA-256 (32 bytes) over everything before it
//!
//! Version 1 lacked the per-entry payload check, quality code and flags;
//! it is migrated transparently on load (payload check 0 means "no check
//! recorded").
//!
//! The index is replaced atomically: written to a temp file, synced, then
//! renamed over the old one. A crash between payload append and index save
//! only strands unreferenced shard bytes, which the orphan cleanup
//! reclaims on the next start.

use crate::error::PersistError;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rfb_cache::key::QualityCode;
use rfb_protocol::messages::types::PixelFormat;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Cursor, Read, Write};
use std::path::Path;

/// Name of the index file inside the cache directory.
pub const INDEX_FILE_NAME: &str = "index.dat";

const MAGIC: &[u8; 4] = b"RCCI";
const VERSION: u32 = 2;
const HEADER_LEN: usize = 16;
const CHECKSUM_LEN: usize = 32;

const ENTRY_LEN_V1: usize = 62;
const ENTRY_LEN_V2: usize = 68;

/// One index record: where a payload lives and what it is.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub hash: [u8; 16],
    pub shard_id: u32,
    pub payload_offset: u64,
    pub payload_size: u32,
    pub width: u16,
    pub height: u16,
    /// Stride in pixels; payloads are tightly packed so this equals width.
    pub stride_pixels: u16,
    pub pixel_format: PixelFormat,
    /// Session-level content hash of the payload.
    pub canonical_hash: u64,
    /// Leading 4 bytes of SHA-256 over the payload, checked on hydration.
    /// Zero means no check was recorded (migrated v1 entries).
    pub payload_check: u32,
    pub quality: QualityCode,
    pub flags: u8,
}

impl IndexEntry {
    /// Serialize one entry in the current (v2) layout.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.hash);
        out.write_u32::<BigEndian>(self.shard_id).unwrap();
        out.write_u64::<BigEndian>(self.payload_offset).unwrap();
        out.write_u32::<BigEndian>(self.payload_size).unwrap();
        out.write_u16::<BigEndian>(self.width).unwrap();
        out.write_u16::<BigEndian>(self.height).unwrap();
        out.write_u16::<BigEndian>(self.stride_pixels).unwrap();
        write_pixel_format(out, &self.pixel_format);
        out.write_u64::<BigEndian>(self.canonical_hash).unwrap();
        out.write_u32::<BigEndian>(self.payload_check).unwrap();
        out.push(self.quality.bits());
        out.push(self.flags);
    }

    /// Parse one entry in the given format version.
    pub fn read_from(cursor: &mut Cursor<&[u8]>, version: u32) -> Result<Self, PersistError> {
        let mut hash = [0u8; 16];
        cursor.read_exact(&mut hash)?;
        let shard_id = cursor.read_u32::<BigEndian>()?;
        let payload_offset = cursor.read_u64::<BigEndian>()?;
        let payload_size = cursor.read_u32::<BigEndian>()?;
        let width = cursor.read_u16::<BigEndian>()?;
        let height = cursor.read_u16::<BigEndian>()?;
        let stride_pixels = cursor.read_u16::<BigEndian>()?;
        let pixel_format = read_pixel_format(cursor)?;
        let canonical_hash = cursor.read_u64::<BigEndian>()?;

        let (payload_check, quality, flags) = if version >= 2 {
            let check = cursor.read_u32::<BigEndian>()?;
            let quality = QualityCode::from_bits(cursor.read_u8()?);
            let flags = cursor.read_u8()?;
            (check, quality, flags)
        } else {
            // v1 recorded neither; assume lossless full-depth content.
            (0, QualityCode::new(true, 32), 0)
        };

        if stride_pixels < width {
            return Err(PersistError::Format(format!(
                "index entry stride {} narrower than width {}",
                stride_pixels, width
            )));
        }

        Ok(Self {
            hash,
            shard_id,
            payload_offset,
            payload_size,
            width,
            height,
            stride_pixels,
            pixel_format,
            canonical_hash,
            payload_check,
            quality,
            flags,
        })
    }

    fn wire_len(version: u32) -> usize {
        if version >= 2 {
            ENTRY_LEN_V2
        } else {
            ENTRY_LEN_V1
        }
    }
}

fn write_pixel_format(out: &mut Vec<u8>, pf: &PixelFormat) {
    out.push(pf.bits_per_pixel);
    out.push(pf.depth);
    out.push(pf.big_endian);
    out.push(pf.true_color);
    out.write_u16::<BigEndian>(pf.red_max).unwrap();
    out.write_u16::<BigEndian>(pf.green_max).unwrap();
    out.write_u16::<BigEndian>(pf.blue_max).unwrap();
    out.push(pf.red_shift);
    out.push(pf.green_shift);
    out.push(pf.blue_shift);
    out.extend_from_slice(&[0, 0, 0]);
}

fn read_pixel_format(cursor: &mut Cursor<&[u8]>) -> Result<PixelFormat, PersistError> {
    let bits_per_pixel = cursor.read_u8()?;
    let depth = cursor.read_u8()?;
    let big_endian = cursor.read_u8()?;
    let true_color = cursor.read_u8()?;
    let red_max = cursor.read_u16::<BigEndian>()?;
    let green_max = cursor.read_u16::<BigEndian>()?;
    let blue_max = cursor.read_u16::<BigEndian>()?;
    let red_shift = cursor.read_u8()?;
    let green_shift = cursor.read_u8()?;
    let blue_shift = cursor.read_u8()?;
    let mut padding = [0u8; 3];
    cursor.read_exact(&mut padding)?;

    Ok(PixelFormat {
        bits_per_pixel,
        depth,
        big_endian,
        true_color,
        red_max,
        green_max,
        blue_max,
        red_shift,
        green_shift,
        blue_shift,
    })
}

/// Serialize and atomically replace the index file.
pub fn write_index(path: &Path, entries: &[IndexEntry]) -> Result<(), PersistError> {
    let mut buf = Vec::with_capacity(HEADER_LEN + entries.len() * ENTRY_LEN_V2 + CHECKSUM_LEN);
    buf.extend_from_slice(MAGIC);
    buf.write_u32::<BigEndian>(VERSION).unwrap();
    buf.write_u32::<BigEndian>(entries.len() as u32).unwrap();
    buf.write_u32::<BigEndian>(0).unwrap(); // reserved

    for entry in entries {
        entry.write_to(&mut buf);
    }

    let checksum = Sha256::digest(&buf);
    buf.extend_from_slice(&checksum);

    let tmp = path.with_extension("dat.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Parse the index file, verifying magic, version, and checksum, and
/// migrating older formats.
pub fn read_index(path: &Path) -> Result<Vec<IndexEntry>, PersistError> {
    let data = fs::read(path)?;
    if data.len() < HEADER_LEN + CHECKSUM_LEN {
        return Err(PersistError::Format(format!(
            "index too short: {} bytes",
            data.len()
        )));
    }

    let (body, checksum) = data.split_at(data.len() - CHECKSUM_LEN);
    let computed = Sha256::digest(body);
    if computed.as_slice() != checksum {
        return Err(PersistError::Format("index checksum mismatch".into()));
    }

    let mut cursor = Cursor::new(body);
    let mut magic = [0u8; 4];
    cursor.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(PersistError::Format(format!("bad index magic {:?}", magic)));
    }
    let version = cursor.read_u32::<BigEndian>()?;
    if version == 0 || version > VERSION {
        return Err(PersistError::Format(format!(
            "unsupported index version {}",
            version
        )));
    }
    let count = cursor.read_u32::<BigEndian>()? as usize;
    let _reserved = cursor.read_u32::<BigEndian>()?;

    let expected = HEADER_LEN + count * IndexEntry::wire_len(version);
    if body.len() != expected {
        return Err(PersistError::Format(format!(
            "index body is {} bytes, expected {} for {} v{} entries",
            body.len(),
            expected,
            count,
            version
        )));
    }

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(IndexEntry::read_from(&mut cursor, version)?);
    }

    if version < VERSION {
        tracing::info!("migrated index from format v{} ({} entries)", version, count);
    }

    Ok(entries)
}
