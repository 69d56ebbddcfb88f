//! Cache control messages (viewer to server).
//!
//! These messages keep the server's per-viewer id sets synchronized with
//! what the viewer actually holds:
//!
//! - [`CacheEviction`] / [`PersistentCacheEviction`] - the viewer dropped
//!   entries; the server must stop referencing them
//! - [`PersistentCacheQuery`] - the viewer asks whether it should expect
//!   content for hashes it is missing
//! - [`PersistentCacheHashList`] - chunked inventory sent at session start
//!   to prime the server's known set
//! - [`RequestCachedData`] - resynchronization signal after a session-cache
//!   miss; the server demotes the id and re-sends an init
//!
//! `read_from` parses the body after the message-type byte has been consumed
//! by the dispatcher; `write_to` emits the type byte and the body.

use super::cache::MAX_HASH_LEN;
use crate::io::{RfbInStream, RfbOutStream};
use tokio::io::{AsyncRead, AsyncWrite};

/// CacheEviction message type.
pub const MSG_CACHE_EVICTION: u8 = 104;

/// PersistentCacheEviction message type.
pub const MSG_PERSISTENT_CACHE_EVICTION: u8 = 105;

/// PersistentCacheQuery message type.
pub const MSG_PERSISTENT_CACHE_QUERY: u8 = 106;

/// PersistentCacheHashList message type.
pub const MSG_PERSISTENT_CACHE_HASH_LIST: u8 = 107;

/// RequestCachedData message type.
pub const MSG_REQUEST_CACHED_DATA: u8 = 109;

/// Hard cap on ids/hashes per message. Larger counts are protocol errors.
pub const MAX_IDS_PER_MESSAGE: usize = 1000;

fn invalid_data(msg: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg)
}

fn invalid_input(msg: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, msg)
}

fn check_count(count: usize, what: &str) -> std::io::Result<()> {
    if count > MAX_IDS_PER_MESSAGE {
        return Err(invalid_data(format!(
            "{} count {} exceeds limit {}",
            what, count, MAX_IDS_PER_MESSAGE
        )));
    }
    Ok(())
}

async fn read_hash_entry<R: AsyncRead + Unpin>(
    stream: &mut RfbInStream<R>,
) -> std::io::Result<Vec<u8>> {
    let len = stream.read_u8().await? as usize;
    if len == 0 || len > MAX_HASH_LEN {
        return Err(invalid_data(format!(
            "hash length must be 1..={}, got {}",
            MAX_HASH_LEN, len
        )));
    }
    let mut hash = vec![0u8; len];
    stream.read_bytes(&mut hash).await?;
    Ok(hash)
}

fn write_hash_entry<W: AsyncWrite + Unpin>(
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

/// Session-cache eviction notification.
///
/// # Wire Format
///
/// - 1 byte: message type (104)
/// - 1 byte: padding
/// - 2 bytes: padding
/// - 4 bytes: count
/// - count x 8 bytes: cache ids
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEviction {
    pub ids: Vec<u64>,
}

impl CacheEviction {
    pub fn new(ids: Vec<u64>) -> Self {
        Self { ids }
    }

    /// Read the message body (after the type byte).
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        stream.skip(3).await?; // padding
        let count = stream.read_u32().await? as usize;
        check_count(count, "CacheEviction")?;

        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(stream.read_u64().await?);
        }
        Ok(Self { ids })
    }

    /// Write the message including the type byte.
    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        if self.ids.len() > MAX_IDS_PER_MESSAGE {
            return Err(invalid_input(format!(
                "CacheEviction count {} exceeds limit {}",
                self.ids.len(),
                MAX_IDS_PER_MESSAGE
            )));
        }
        stream.write_u8(MSG_CACHE_EVICTION);
        stream.write_u8(0);
        stream.write_u16(0);
        stream.write_u32(self.ids.len() as u32);
        for id in &self.ids {
            stream.write_u64(*id);
        }
        Ok(())
    }
}

/// Persistent-cache eviction notification.
///
/// # Wire Format
///
/// - 1 byte: message type (105)
/// - 1 byte: padding
/// - 2 bytes: padding
/// - 4 bytes: count
/// - count x (1 byte hash_len + hash bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentCacheEviction {
    pub hashes: Vec<Vec<u8>>,
}

impl PersistentCacheEviction {
    pub fn new(hashes: Vec<Vec<u8>>) -> Self {
        Self { hashes }
    }

    /// Read the message body (after the type byte).
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        stream.skip(3).await?; // padding
        let count = stream.read_u32().await? as usize;
        check_count(count, "PersistentCacheEviction")?;

        let mut hashes = Vec::with_capacity(count);
        for _ in 0..count {
            hashes.push(read_hash_entry(stream).await?);
        }
        Ok(Self { hashes })
    }

    /// Write the message including the type byte.
    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        if self.hashes.len() > MAX_IDS_PER_MESSAGE {
            return Err(invalid_input(format!(
                "PersistentCacheEviction count {} exceeds limit {}",
                self.hashes.len(),
                MAX_IDS_PER_MESSAGE
            )));
        }
        stream.write_u8(MSG_PERSISTENT_CACHE_EVICTION);
        stream.write_u8(0);
        stream.write_u16(0);
        stream.write_u32(self.hashes.len() as u32);
        for hash in &self.hashes {
            write_hash_entry(stream, hash)?;
        }
        Ok(())
    }
}

/// Query whether the server can supply content for missing hashes.
///
/// # Wire Format
///
/// - 1 byte: message type (106)
/// - 2 bytes: count
/// - count x (1 byte hash_len + hash bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentCacheQuery {
    pub hashes: Vec<Vec<u8>>,
}

impl PersistentCacheQuery {
    pub fn new(hashes: Vec<Vec<u8>>) -> Self {
        Self { hashes }
    }

    /// Read the message body (after the type byte).
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        let count = stream.read_u16().await? as usize;
        check_count(count, "PersistentCacheQuery")?;

        let mut hashes = Vec::with_capacity(count);
        for _ in 0..count {
            hashes.push(read_hash_entry(stream).await?);
        }
        Ok(Self { hashes })
    }

    /// Write the message including the type byte.
    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        if self.hashes.len() > MAX_IDS_PER_MESSAGE {
            return Err(invalid_input(format!(
                "PersistentCacheQuery count {} exceeds limit {}",
                self.hashes.len(),
                MAX_IDS_PER_MESSAGE
            )));
        }
        stream.write_u8(MSG_PERSISTENT_CACHE_QUERY);
        stream.write_u16(self.hashes.len() as u16);
        for hash in &self.hashes {
            write_hash_entry(stream, hash)?;
        }
        Ok(())
    }
}

/// Chunked inventory of the viewer's persistent cache, sent at session start
/// so the server can reference content from earlier sessions without
/// re-sending inits.
///
/// # Wire Format
///
/// - 1 byte: message type (107)
/// - 4 bytes: sequence_id (identifies one inventory transfer)
/// - 2 bytes: total_chunks
/// - 2 bytes: chunk_index (0-based, < total_chunks)
/// - 2 bytes: count
/// - count x (1 byte hash_len + hash bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentCacheHashList {
    pub sequence_id: u32,
    pub total_chunks: u16,
    pub chunk_index: u16,
    pub hashes: Vec<Vec<u8>>,
}

impl PersistentCacheHashList {
    pub fn new(sequence_id: u32, total_chunks: u16, chunk_index: u16, hashes: Vec<Vec<u8>>) -> Self {
        Self {
            sequence_id,
            total_chunks,
            chunk_index,
            hashes,
        }
    }

    /// Read the message body (after the type byte).
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        let sequence_id = stream.read_u32().await?;
        let total_chunks = stream.read_u16().await?;
        let chunk_index = stream.read_u16().await?;

        if total_chunks == 0 {
            return Err(invalid_data(
                "PersistentCacheHashList total_chunks must be non-zero".into(),
            ));
        }
        if chunk_index >= total_chunks {
            return Err(invalid_data(format!(
                "PersistentCacheHashList chunk_index {} out of range (total {})",
                chunk_index, total_chunks
            )));
        }

        let count = stream.read_u16().await? as usize;
        check_count(count, "PersistentCacheHashList")?;

        let mut hashes = Vec::with_capacity(count);
        for _ in 0..count {
            hashes.push(read_hash_entry(stream).await?);
        }

        Ok(Self {
            sequence_id,
            total_chunks,
            chunk_index,
            hashes,
        })
    }

    /// Write the message including the type byte.
    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        if self.total_chunks == 0 || self.chunk_index >= self.total_chunks {
            return Err(invalid_input(format!(
                "PersistentCacheHashList chunk {}/{} out of range",
                self.chunk_index, self.total_chunks
            )));
        }
        if self.hashes.len() > MAX_IDS_PER_MESSAGE {
            return Err(invalid_input(format!(
                "PersistentCacheHashList count {} exceeds limit {}",
                self.hashes.len(),
                MAX_IDS_PER_MESSAGE
            )));
        }
        stream.write_u8(MSG_PERSISTENT_CACHE_HASH_LIST);
        stream.write_u32(self.sequence_id);
        stream.write_u16(self.total_chunks);
        stream.write_u16(self.chunk_index);
        stream.write_u16(self.hashes.len() as u16);
        for hash in &self.hashes {
            write_hash_entry(stream, hash)?;
        }
        Ok(())
    }
}

/// Request for cached data the viewer does not hold.
///
/// Sent after a session-cache miss on a [`CachedRect`] reference. Not an
/// error: it is the resynchronization signal that makes the server demote
/// the id and schedule a targeted re-init.
///
/// [`CachedRect`]: super::cache::CachedRect
///
/// # Wire Format
///
/// - 1 byte: message type (109)
/// - 8 bytes: cache_id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestCachedData {
    pub cache_id: u64,
}

impl RequestCachedData {
    pub fn new(cache_id: u64) -> Self {
        debug_assert_ne!(cache_id, 0, "cache id must be non-zero");
        Self { cache_id }
    }

    /// Read the message body (after the type byte).
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        let cache_id = stream.read_u64().await?;
        if cache_id == 0 {
            return Err(invalid_data(
                "RequestCachedData cache_id must be non-zero".into(),
            ));
        }
        Ok(Self { cache_id })
    }

    /// Write the message including the type byte.
    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        if self.cache_id == 0 {
            return Err(invalid_input(
                "RequestCachedData cache_id must be non-zero".into(),
            ));
        }
        stream.write_u8(MSG_REQUEST_CACHED_DATA);
        stream.write_u64(self.cache_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn round_trip_body(written: Vec<u8>, expected_type: u8) -> Vec<u8> {
        assert_eq!(written[0], expected_type);
        written[1..].to_vec()
    }

    #[tokio::test]
    async fn test_cache_eviction_round_trip() {
        let original = CacheEviction::new(vec![1, 2, u64::MAX]);

        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        original.write_to(&mut out).unwrap();
        out.flush().await.unwrap();
        // type + pad(3) + count(4) + 3 ids
        assert_eq!(buffer.len(), 1 + 3 + 4 + 3 * 8);

        let body = round_trip_body(buffer, MSG_CACHE_EVICTION).await;
        let mut inp = RfbInStream::new(Cursor::new(body));
        let read_back = CacheEviction::read_from(&mut inp).await.unwrap();
        assert_eq!(original, read_back);
    }

    #[tokio::test]
    async fn test_cache_eviction_oversize_count_rejected() {
        let mut body = vec![0u8, 0, 0];
        body.extend_from_slice(&1001u32.to_be_bytes());
        let mut inp = RfbInStream::new(Cursor::new(body));
        let result = CacheEviction::read_from(&mut inp).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("exceeds limit"));

        let msg = CacheEviction::new(vec![1; 1001]);
        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        assert!(msg.write_to(&mut out).is_err());
    }

    #[tokio::test]
    async fn test_persistent_eviction_round_trip() {
        let original = PersistentCacheEviction::new(vec![vec![1u8; 16], vec![2u8; 16]]);

        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        original.write_to(&mut out).unwrap();
        out.flush().await.unwrap();

        let body = round_trip_body(buffer, MSG_PERSISTENT_CACHE_EVICTION).await;
        let mut inp = RfbInStream::new(Cursor::new(body));
        let read_back = PersistentCacheEviction::read_from(&mut inp).await.unwrap();
        assert_eq!(original, read_back);
    }

    #[tokio::test]
    async fn test_persistent_eviction_bad_hash_len_rejected() {
        let mut body = vec![0u8, 0, 0];
        body.extend_from_slice(&1u32.to_be_bytes());
        body.push(0); // zero-length hash
        let mut inp = RfbInStream::new(Cursor::new(body));
        assert!(PersistentCacheEviction::read_from(&mut inp).await.is_err());
    }

    #[tokio::test]
    async fn test_query_round_trip() {
        let original = PersistentCacheQuery::new(vec![vec![0xAB; 16]]);

        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        original.write_to(&mut out).unwrap();
        out.flush().await.unwrap();
        assert_eq!(buffer.len(), 1 + 2 + 1 + 16);

        let body = round_trip_body(buffer, MSG_PERSISTENT_CACHE_QUERY).await;
        let mut inp = RfbInStream::new(Cursor::new(body));
        let read_back = PersistentCacheQuery::read_from(&mut inp).await.unwrap();
        assert_eq!(original, read_back);
    }

    #[tokio::test]
    async fn test_hash_list_round_trip() {
        let original = PersistentCacheHashList::new(7, 3, 1, vec![vec![5u8; 16], vec![6u8; 16]]);

        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        original.write_to(&mut out).unwrap();
        out.flush().await.unwrap();

        let body = round_trip_body(buffer, MSG_PERSISTENT_CACHE_HASH_LIST).await;
        let mut inp = RfbInStream::new(Cursor::new(body));
        let read_back = PersistentCacheHashList::read_from(&mut inp).await.unwrap();
        assert_eq!(original, read_back);
    }

    #[tokio::test]
    async fn test_hash_list_chunk_bounds() {
        // chunk_index == total_chunks is out of range
        let msg = PersistentCacheHashList::new(1, 2, 2, vec![]);
        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        assert!(msg.write_to(&mut out).is_err());

        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_be_bytes());
        body.extend_from_slice(&0u16.to_be_bytes()); // total_chunks = 0
        body.extend_from_slice(&0u16.to_be_bytes());
        body.extend_from_slice(&0u16.to_be_bytes());
        let mut inp = RfbInStream::new(Cursor::new(body));
        assert!(PersistentCacheHashList::read_from(&mut inp).await.is_err());
    }

    #[tokio::test]
    async fn test_request_cached_data_round_trip() {
        let original = RequestCachedData::new(42);

        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        original.write_to(&mut out).unwrap();
        out.flush().await.unwrap();
        assert_eq!(buffer.len(), 9);

        let body = round_trip_body(buffer, MSG_REQUEST_CACHED_DATA).await;
        let mut inp = RfbInStream::new(Cursor::new(body));
        let read_back = RequestCachedData::read_from(&mut inp).await.unwrap();
        assert_eq!(original, read_back);
    }

    #[tokio::test]
    async fn test_request_cached_data_zero_id_rejected() {
        let body = vec![0u8; 8];
        let mut inp = RfbInStream::new(Cursor::new(body));
        assert!(RequestCachedData::read_from(&mut inp).await.is_err());
    }
}
