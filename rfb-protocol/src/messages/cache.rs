//! Cache rectangle encodings.
//!
//! Four rectangle payloads implement the cache protocol. Each sits inside a
//! standard `FramebufferUpdate` rectangle header (12 bytes):
//!
//! 1. **First time content appears**: the server sends [`CachedRectInit`]
//!    (or [`PersistentCachedRectInit`]) carrying the identifier, the inner
//!    encoding, and the encoded pixels. The viewer decodes and stores.
//! 2. **Content repeats**: the server sends [`CachedRect`] (8 bytes of
//!    payload) or [`PersistentCachedRect`] (hash reference). The viewer
//!    blits from its cache.
//! 3. **Cache miss**: the viewer requests the data again and the server
//!    re-sends an init.

use crate::io::{RfbInStream, RfbOutStream};
use tokio::io::{AsyncRead, AsyncWrite};

/// Maximum accepted content-hash length in bytes.
pub const MAX_HASH_LEN: usize = 64;

/// Maximum accepted init payload length. Larger announcements are protocol
/// errors rather than allocation requests.
pub const MAX_INIT_PAYLOAD_LEN: u32 = 64 * 1024 * 1024;

fn invalid_data(msg: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg)
}

fn invalid_input(msg: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, msg)
}

fn is_cache_encoding(encoding: i32) -> bool {
    matches!(
        encoding,
        super::types::ENCODING_CACHED_RECT
            | super::types::ENCODING_CACHED_RECT_INIT
            | super::types::ENCODING_PERSISTENT_CACHED_RECT
            | super::types::ENCODING_PERSISTENT_CACHED_RECT_INIT
    )
}

async fn read_hash<R: AsyncRead + Unpin>(
    stream: &mut RfbInStream<R>,
) -> std::io::Result<Vec<u8>> {
    let hash_len = stream.read_u8().await? as usize;
    if hash_len == 0 || hash_len > MAX_HASH_LEN {
        return Err(invalid_data(format!(
            "hash length must be 1..={}, got {}",
            MAX_HASH_LEN, hash_len
        )));
    }
    let mut hash = vec![0u8; hash_len];
    stream.read_bytes(&mut hash).await?;
    Ok(hash)
}

fn write_hash<W: AsyncWrite + Unpin>(
    stream: &mut RfbOutStream<W>,
    hash: &[u8],
) -> std::io::Result<()> {
    if hash.is_empty() || hash.len() > MAX_HASH_LEN {
        return Err(invalid_input(format!(
            "hash length must be 1..={}, got {}",
            MAX_HASH_LEN,
            hash.len()
        )));
    }
    stream.write_u8(hash.len() as u8);
    stream.write_bytes(hash);
    Ok(())
}

/// CachedRect - reference to already-cached session content.
///
/// # Wire Format (after the 12-byte rectangle header)
///
/// - 8 bytes: cache_id (u64, big-endian)
///
/// 20 bytes on the wire in total, against kilobytes for re-encoded pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedRect {
    /// Server-assigned content identifier. Must be non-zero (0 is the
    /// null-hash sentinel).
    pub cache_id: u64,
}

impl CachedRect {
    /// Create a new CachedRect.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if `cache_id` is 0.
    pub fn new(cache_id: u64) -> Self {
        debug_assert_ne!(cache_id, 0, "cache id must be non-zero");
        Self { cache_id }
    }

    /// Read a CachedRect payload. The rectangle header is read separately.
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        let cache_id = stream.read_u64().await?;
        if cache_id == 0 {
            return Err(invalid_data("CachedRect cache_id must be non-zero".into()));
        }
        Ok(Self { cache_id })
    }

    /// Write a CachedRect payload. The rectangle header is written separately.
    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        if self.cache_id == 0 {
            return Err(invalid_input("CachedRect cache_id must be non-zero".into()));
        }
        stream.write_u64(self.cache_id);
        Ok(())
    }
}

/// CachedRectInit - first transmission of session-cached content.
///
/// # Wire Format (after the 12-byte rectangle header)
///
/// - 8 bytes: cache_id (u64, big-endian)
/// - 4 bytes: inner_encoding (i32, big-endian)
/// - N bytes: encoded pixel data, read/written by the inner codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedRectInit {
    /// Identifier the viewer stores the decoded pixels under.
    pub cache_id: u64,

    /// Encoding of the pixel data that follows. Must not itself be a cache
    /// encoding (no recursive caching).
    pub inner_encoding: i32,
}

impl CachedRectInit {
    /// Create a new CachedRectInit.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if `cache_id` is 0 or `inner_encoding` is a
    /// cache encoding.
    pub fn new(cache_id: u64, inner_encoding: i32) -> Self {
        debug_assert_ne!(cache_id, 0, "cache id must be non-zero");
        debug_assert!(
            !is_cache_encoding(inner_encoding),
            "inner encoding cannot be a cache encoding"
        );
        Self {
            cache_id,
            inner_encoding,
        }
    }

    /// Read the 12-byte metadata. The encoded pixel data is consumed
    /// separately by the inner codec.
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        let cache_id = stream.read_u64().await?;
        let inner_encoding = stream.read_i32().await?;

        if cache_id == 0 {
            return Err(invalid_data(
                "CachedRectInit cache_id must be non-zero".into(),
            ));
        }
        if is_cache_encoding(inner_encoding) {
            return Err(invalid_data(format!(
                "CachedRectInit inner encoding cannot be a cache encoding, got {}",
                inner_encoding
            )));
        }

        Ok(Self {
            cache_id,
            inner_encoding,
        })
    }

    /// Write the 12-byte metadata. The encoded pixel data is written
    /// separately.
    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        if self.cache_id == 0 {
            return Err(invalid_input(
                "CachedRectInit cache_id must be non-zero".into(),
            ));
        }
        if is_cache_encoding(self.inner_encoding) {
            return Err(invalid_input(format!(
                "CachedRectInit inner encoding cannot be a cache encoding, got {}",
                self.inner_encoding
            )));
        }

        stream.write_u64(self.cache_id);
        stream.write_i32(self.inner_encoding);
        Ok(())
    }
}

/// PersistentCachedRect - reference by canonical content hash.
///
/// # Wire Format (after the 12-byte rectangle header)
///
/// - 1 byte: hash_len (1..=64)
/// - hash_len bytes: canonical hash
/// - 2 bytes: flags (reserved, must be zero)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentCachedRect {
    /// Canonical content hash (16 bytes in the current scheme).
    pub hash: Vec<u8>,
}

impl PersistentCachedRect {
    /// Create a new PersistentCachedRect.
    pub fn new(hash: Vec<u8>) -> Self {
        Self { hash }
    }

    /// Read a PersistentCachedRect payload.
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        let hash = read_hash(stream).await?;
        let flags = stream.read_u16().await?;
        if flags != 0 {
            return Err(invalid_data(format!(
                "PersistentCachedRect flags must be zero, got {:#x}",
                flags
            )));
        }
        Ok(Self { hash })
    }

    /// Write a PersistentCachedRect payload.
    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        write_hash(stream, &self.hash)?;
        stream.write_u16(0); // flags, reserved
        Ok(())
    }
}

/// PersistentCachedRectInit - first transmission of persistent content.
///
/// # Wire Format (after the 12-byte rectangle header)
///
/// - 1 byte: hash_len (1..=64)
/// - hash_len bytes: canonical hash
/// - 4 bytes: inner_encoding (i32)
/// - 4 bytes: payload_len (u32)
/// - payload_len bytes: encoded pixel data
///
/// Unlike [`CachedRectInit`], the payload length is explicit so the message
/// can be reframed by intermediaries that do not know the inner codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentCachedRectInit {
    pub hash: Vec<u8>,
    pub inner_encoding: i32,
    pub payload: Vec<u8>,
}

impl PersistentCachedRectInit {
    /// Create a new PersistentCachedRectInit.
    pub fn new(hash: Vec<u8>, inner_encoding: i32, payload: Vec<u8>) -> Self {
        debug_assert!(
            !is_cache_encoding(inner_encoding),
            "inner encoding cannot be a cache encoding"
        );
        Self {
            hash,
            inner_encoding,
            payload,
        }
    }

    /// Read a full PersistentCachedRectInit including its payload.
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        let hash = read_hash(stream).await?;
        let inner_encoding = stream.read_i32().await?;
        if is_cache_encoding(inner_encoding) {
            return Err(invalid_data(format!(
                "PersistentCachedRectInit inner encoding cannot be a cache encoding, got {}",
                inner_encoding
            )));
        }

        let payload_len = stream.read_u32().await?;
        if payload_len > MAX_INIT_PAYLOAD_LEN {
            return Err(invalid_data(format!(
                "PersistentCachedRectInit payload length {} exceeds limit {}",
                payload_len, MAX_INIT_PAYLOAD_LEN
            )));
        }

        let mut payload = vec![0u8; payload_len as usize];
        stream.read_bytes(&mut payload).await?;

        Ok(Self {
            hash,
            inner_encoding,
            payload,
        })
    }

    /// Write a full PersistentCachedRectInit including its payload.
    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        if is_cache_encoding(self.inner_encoding) {
            return Err(invalid_input(format!(
                "PersistentCachedRectInit inner encoding cannot be a cache encoding, got {}",
                self.inner_encoding
            )));
        }
        if self.payload.len() as u64 > MAX_INIT_PAYLOAD_LEN as u64 {
            return Err(invalid_input(format!(
                "PersistentCachedRectInit payload length {} exceeds limit {}",
                self.payload.len(),
                MAX_INIT_PAYLOAD_LEN
            )));
        }

        write_hash(stream, &self.hash)?;
        stream.write_i32(self.inner_encoding);
        stream.write_u32(self.payload.len() as u32);
        stream.write_bytes(&self.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::types::{ENCODING_CACHED_RECT, ENCODING_RAW, ENCODING_TIGHT};
    use std::io::Cursor;

    #[tokio::test]
    async fn test_cached_rect_round_trip() {
        let original = CachedRect::new(12345);

        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        original.write_to(&mut out).unwrap();
        out.flush().await.unwrap();
        assert_eq!(buffer.len(), 8);

        let mut inp = RfbInStream::new(Cursor::new(buffer));
        let read_back = CachedRect::read_from(&mut inp).await.unwrap();
        assert_eq!(original, read_back);
    }

    #[tokio::test]
    async fn test_cached_rect_zero_id_rejected() {
        let data = vec![0u8; 8];
        let mut stream = RfbInStream::new(Cursor::new(data));
        let result = CachedRect::read_from(&mut stream).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("non-zero"));
    }

    #[tokio::test]
    async fn test_cached_rect_init_round_trip() {
        let original = CachedRectInit::new(67890, ENCODING_TIGHT);

        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        original.write_to(&mut out).unwrap();
        out.flush().await.unwrap();
        assert_eq!(buffer.len(), 12); // 8 + 4

        let mut inp = RfbInStream::new(Cursor::new(buffer));
        let read_back = CachedRectInit::read_from(&mut inp).await.unwrap();
        assert_eq!(original, read_back);
    }

    #[tokio::test]
    async fn test_cached_rect_init_recursive_encoding_rejected() {
        let mut data = vec![0u8; 12];
        data[0..8].copy_from_slice(&12345u64.to_be_bytes());
        data[8..12].copy_from_slice(&ENCODING_CACHED_RECT.to_be_bytes());

        let mut stream = RfbInStream::new(Cursor::new(data));
        let result = CachedRectInit::read_from(&mut stream).await;
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("cannot be a cache encoding"));
    }

    #[tokio::test]
    async fn test_persistent_cached_rect_round_trip() {
        let original = PersistentCachedRect::new(vec![7u8; 16]);

        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        original.write_to(&mut out).unwrap();
        out.flush().await.unwrap();
        assert_eq!(buffer.len(), 1 + 16 + 2);
        assert_eq!(buffer[0], 16); // hash_len

        let mut inp = RfbInStream::new(Cursor::new(buffer));
        let read_back = PersistentCachedRect::read_from(&mut inp).await.unwrap();
        assert_eq!(original, read_back);
    }

    #[tokio::test]
    async fn test_persistent_cached_rect_nonzero_flags_rejected() {
        let mut buffer = Vec::new();
        buffer.push(2); // hash_len
        buffer.extend_from_slice(&[0xAA, 0xBB]);
        buffer.extend_from_slice(&1u16.to_be_bytes()); // non-zero flags

        let mut stream = RfbInStream::new(Cursor::new(buffer));
        assert!(PersistentCachedRect::read_from(&mut stream).await.is_err());
    }

    #[tokio::test]
    async fn test_persistent_cached_rect_hash_len_bounds() {
        // Zero-length hash
        let data = vec![0u8, 0, 0];
        let mut stream = RfbInStream::new(Cursor::new(data));
        assert!(PersistentCachedRect::read_from(&mut stream).await.is_err());

        // Over-long hash
        let mut data = vec![65u8];
        data.extend_from_slice(&[0u8; 67]);
        let mut stream = RfbInStream::new(Cursor::new(data));
        assert!(PersistentCachedRect::read_from(&mut stream).await.is_err());

        // Over-long on write as well
        let msg = PersistentCachedRect::new(vec![0u8; 65]);
        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        assert!(msg.write_to(&mut out).is_err());
    }

    #[tokio::test]
    async fn test_persistent_cached_rect_init_round_trip() {
        let original =
            PersistentCachedRectInit::new(vec![3u8; 16], ENCODING_RAW, vec![9u8; 128]);

        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        original.write_to(&mut out).unwrap();
        out.flush().await.unwrap();
        assert_eq!(buffer.len(), 1 + 16 + 4 + 4 + 128);

        let mut inp = RfbInStream::new(Cursor::new(buffer));
        let read_back = PersistentCachedRectInit::read_from(&mut inp).await.unwrap();
        assert_eq!(original, read_back);
    }

    #[tokio::test]
    async fn test_persistent_cached_rect_init_oversize_payload_rejected() {
        let mut buffer = Vec::new();
        buffer.push(1);
        buffer.push(0xAB);
        buffer.extend_from_slice(&ENCODING_RAW.to_be_bytes());
        buffer.extend_from_slice(&(MAX_INIT_PAYLOAD_LEN + 1).to_be_bytes());

        let mut stream = RfbInStream::new(Cursor::new(buffer));
        let result = PersistentCachedRectInit::read_from(&mut stream).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("exceeds limit"));
    }

    #[tokio::test]
    async fn test_large_cache_id() {
        let original = CachedRect::new(u64::MAX);

        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        original.write_to(&mut out).unwrap();
        out.flush().await.unwrap();

        let mut inp = RfbInStream::new(Cursor::new(buffer));
        assert_eq!(CachedRect::read_from(&mut inp).await.unwrap(), original);
    }
}
