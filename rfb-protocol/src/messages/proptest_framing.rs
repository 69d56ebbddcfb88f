//! Property tests for cache message framing.
//!
//! These tests verify that message parsing is robust against fragmentation
//! at arbitrary byte boundaries, which is critical for correct operation
//! over real network streams.

#[cfg(test)]
mod tests {
    use super::super::cache::*;
    use super::super::control::*;
    use crate::io::{RfbInStream, RfbOutStream};
    use proptest::prelude::*;

    /// A fragmenting reader that splits reads at a specific boundary,
    /// simulating network fragmentation.
    struct FragmentingReader {
        data: Vec<u8>,
        pos: usize,
        boundary: usize,
    }

    impl FragmentingReader {
        fn new(data: Vec<u8>, boundary: usize) -> Self {
            let boundary = boundary.min(data.len());
            Self {
                data,
                pos: 0,
                boundary,
            }
        }
    }

    impl tokio::io::AsyncRead for FragmentingReader {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            if self.pos >= self.data.len() {
                return std::task::Poll::Ready(Ok(()));
            }

            // Only read up to boundary on first pass, remaining data after.
            let available = if self.pos < self.boundary {
                (self.boundary - self.pos).min(buf.remaining())
            } else {
                (self.data.len() - self.pos).min(buf.remaining())
            };

            if available == 0 {
                return std::task::Poll::Ready(Ok(()));
            }

            let data = &self.data[self.pos..self.pos + available];
            buf.put_slice(data);
            self.pos += available;

            std::task::Poll::Ready(Ok(()))
        }
    }

    fn arbitrary_hash() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 1..=32)
    }

    fn arbitrary_hashes() -> impl Strategy<Value = Vec<Vec<u8>>> {
        prop::collection::vec(arbitrary_hash(), 0..20)
    }

    proptest! {
        /// CachedRect payload survives fragmentation at every boundary.
        #[test]
        fn test_cached_rect_fragmentation(
            cache_id in 1u64..,
            boundary in 0usize..8
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let msg = CachedRect::new(cache_id);

                let mut buffer = Vec::new();
                let mut out_stream = RfbOutStream::new(&mut buffer);
                msg.write_to(&mut out_stream).unwrap();
                out_stream.flush().await.unwrap();

                let reader = FragmentingReader::new(buffer, boundary);
                let mut in_stream = RfbInStream::new(reader);

                let parsed = CachedRect::read_from(&mut in_stream).await.unwrap();
                prop_assert_eq!(msg, parsed);
                Ok(())
            })?;
        }

        /// PersistentCachedRectInit round-trips with arbitrary payloads and
        /// fragmentation boundaries.
        #[test]
        fn test_persistent_init_fragmentation(
            hash in arbitrary_hash(),
            payload in prop::collection::vec(any::<u8>(), 0..512),
            boundary in 0usize..600
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let msg = PersistentCachedRectInit::new(hash, 0, payload);

                let mut buffer = Vec::new();
                let mut out_stream = RfbOutStream::new(&mut buffer);
                msg.write_to(&mut out_stream).unwrap();
                out_stream.flush().await.unwrap();

                let boundary = boundary.min(buffer.len());
                let reader = FragmentingReader::new(buffer, boundary);
                let mut in_stream = RfbInStream::new(reader);

                let parsed = PersistentCachedRectInit::read_from(&mut in_stream).await.unwrap();
                prop_assert_eq!(msg, parsed);
                Ok(())
            })?;
        }

        /// CacheEviction round-trips with arbitrary id lists.
        #[test]
        fn test_cache_eviction_fragmentation(
            ids in prop::collection::vec(any::<u64>(), 0..50),
            boundary in 0usize..500
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let msg = CacheEviction::new(ids);

                let mut buffer = Vec::new();
                let mut out_stream = RfbOutStream::new(&mut buffer);
                msg.write_to(&mut out_stream).unwrap();
                out_stream.flush().await.unwrap();

                // Skip the message-type byte the dispatcher would consume.
                let boundary = boundary.min(buffer.len() - 1);
                let reader = FragmentingReader::new(buffer[1..].to_vec(), boundary);
                let mut in_stream = RfbInStream::new(reader);

                let parsed = CacheEviction::read_from(&mut in_stream).await.unwrap();
                prop_assert_eq!(msg, parsed);
                Ok(())
            })?;
        }

        /// PersistentCacheEviction round-trips with arbitrary hash lists.
        #[test]
        fn test_persistent_eviction_fragmentation(
            hashes in arbitrary_hashes(),
            boundary in 0usize..800
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let msg = PersistentCacheEviction::new(hashes);

                let mut buffer = Vec::new();
                let mut out_stream = RfbOutStream::new(&mut buffer);
                msg.write_to(&mut out_stream).unwrap();
                out_stream.flush().await.unwrap();

                let boundary = boundary.min(buffer.len() - 1);
                let reader = FragmentingReader::new(buffer[1..].to_vec(), boundary);
                let mut in_stream = RfbInStream::new(reader);

                let parsed = PersistentCacheEviction::read_from(&mut in_stream).await.unwrap();
                prop_assert_eq!(msg, parsed);
                Ok(())
            })?;
        }

        /// PersistentCacheHashList round-trips across chunk geometry.
        #[test]
        fn test_hash_list_fragmentation(
            sequence_id in any::<u32>(),
            total_chunks in 1u16..=64,
            hashes in arbitrary_hashes(),
            boundary in 0usize..800
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let chunk_index = total_chunks - 1;
                let msg = PersistentCacheHashList::new(sequence_id, total_chunks, chunk_index, hashes);

                let mut buffer = Vec::new();
                let mut out_stream = RfbOutStream::new(&mut buffer);
                msg.write_to(&mut out_stream).unwrap();
                out_stream.flush().await.unwrap();

                let boundary = boundary.min(buffer.len() - 1);
                let reader = FragmentingReader::new(buffer[1..].to_vec(), boundary);
                let mut in_stream = RfbInStream::new(reader);

                let parsed = PersistentCacheHashList::read_from(&mut in_stream).await.unwrap();
                prop_assert_eq!(msg, parsed);
                Ok(())
            })?;
        }
    }
}
