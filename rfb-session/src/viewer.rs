//! Viewer-side session: consumes framebuffer updates through the cache
//! engine and flushes the engine's outboxes back to the server.

use crate::error::SessionError;
use crate::payload;
use rfb_cache::{Codec, ViewerCacheEngine};
use rfb_common::Rect;
use rfb_pixelbuffer::MutablePixelBuffer;
use rfb_protocol::io::{RfbInStream, RfbOutStream};
use rfb_protocol::messages::cache::{
    CachedRect, CachedRectInit, PersistentCachedRect, PersistentCachedRectInit,
};
use rfb_protocol::messages::control::{
    CacheEviction, PersistentCacheEviction, PersistentCacheHashList, PersistentCacheQuery,
    RequestCachedData, MAX_IDS_PER_MESSAGE,
};
use rfb_protocol::messages::types::{
    Rectangle, ENCODING_CACHED_RECT, ENCODING_CACHED_RECT_INIT, ENCODING_PERSISTENT_CACHED_RECT,
    ENCODING_PERSISTENT_CACHED_RECT_INIT, ENCODING_RAW, ENCODING_TIGHT, ENCODING_ZLIB,
};
use tokio::io::{AsyncRead, AsyncWrite};

/// Cache-aware update consumption for one server connection.
pub struct ViewerSession {
    engine: ViewerCacheEngine,
    inventory_seq: u32,
}

impl ViewerSession {
    pub fn new(engine: ViewerCacheEngine) -> Self {
        Self {
            engine,
            inventory_seq: 0,
        }
    }

    pub fn engine(&self) -> &ViewerCacheEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut ViewerCacheEngine {
        &mut self.engine
    }

    /// Read one framebuffer update (after its message-type byte) and apply
    /// every rectangle to `fb`.
    ///
    /// Rectangles are processed in arrival order. Decode failures drop the
    /// affected rectangle and continue; only framing violations abort.
    pub async fn read_update<R: AsyncRead + Unpin>(
        &mut self,
        stream: &mut RfbInStream<R>,
        fb: &mut dyn MutablePixelBuffer,
    ) -> Result<(), SessionError> {
        stream.skip(1).await?; // padding
        let count = stream.read_u16().await?;

        for _ in 0..count {
            let header = Rectangle::read_from(stream).await?;
            let rect = Rect::new(
                header.x as i32,
                header.y as i32,
                header.width as u32,
                header.height as u32,
            );

            match header.encoding {
                ENCODING_CACHED_RECT => {
                    let msg = CachedRect::read_from(stream).await?;
                    // A miss queues a data request; the rectangle stays
                    // undisplayed until the re-init arrives.
                    if let Err(err) = self.engine.on_cached_rect_ref(rect, msg.cache_id, fb) {
                        tracing::warn!("cached rect ref failed: {}", err);
                    }
                }
                ENCODING_CACHED_RECT_INIT => {
                    let msg = CachedRectInit::read_from(stream).await?;
                    let body = payload::read_payload(
                        stream,
                        msg.inner_encoding,
                        header.width,
                        header.height,
                    )
                    .await?;
                    if let Err(err) = self.engine.on_cached_rect_init(
                        rect,
                        msg.cache_id,
                        msg.inner_encoding,
                        &body,
                        fb,
                    ) {
                        tracing::warn!("cached rect init dropped: {}", err);
                    }
                }
                ENCODING_PERSISTENT_CACHED_RECT => {
                    let msg = PersistentCachedRect::read_from(stream).await?;
                    match fixed_hash(&msg.hash) {
                        Some(hash) => {
                            if let Err(err) = self.engine.on_persistent_rect_ref(rect, hash, fb) {
                                tracing::warn!("persistent ref failed: {}", err);
                            }
                        }
                        None => tracing::warn!("persistent ref with unusable hash width"),
                    }
                }
                ENCODING_PERSISTENT_CACHED_RECT_INIT => {
                    let msg = PersistentCachedRectInit::read_from(stream).await?;
                    match fixed_hash(&msg.hash) {
                        Some(hash) => {
                            if let Err(err) = self.engine.on_persistent_rect_init(
                                rect,
                                hash,
                                msg.inner_encoding,
                                &msg.payload,
                                fb,
                            ) {
                                tracing::warn!("persistent init dropped: {}", err);
                            }
                        }
                        None => tracing::warn!("persistent init with unusable hash width"),
                    }
                }
                ENCODING_RAW | ENCODING_ZLIB | ENCODING_TIGHT => {
                    let body = payload::read_payload(
                        stream,
                        header.encoding,
                        header.width,
                        header.height,
                    )
                    .await?;
                    self.apply_plain(rect, header.encoding, &body, fb);
                }
                other => {
                    return Err(SessionError::Protocol(format!(
                        "unsupported encoding {} in update",
                        other
                    )))
                }
            }
        }
        Ok(())
    }

    /// Decode a plain (non-cache) rectangle and blit it.
    fn apply_plain(
        &self,
        rect: Rect,
        encoding: i32,
        body: &[u8],
        fb: &mut dyn MutablePixelBuffer,
    ) {
        let Some(codec) = Codec::from_encoding_id(encoding) else {
            tracing::warn!("no codec for encoding {}", encoding);
            return;
        };
        match codec.decode(body, rect.width as u16, rect.height as u16) {
            Ok(canonical) => {
                let native = match fb.pixel_format().from_canonical_rect(
                    &canonical,
                    rect.width as usize,
                    rect.height as usize,
                ) {
                    Ok(native) => native,
                    Err(err) => {
                        tracing::warn!("plain rect conversion failed: {}", err);
                        return;
                    }
                };
                if let Err(err) = fb.image_rect(rect, &native, 0) {
                    tracing::warn!("plain rect blit failed: {}", err);
                }
            }
            Err(err) => tracing::warn!("plain rect dropped: {}", err),
        }
    }

    /// Flush the engine outboxes after a frame has been fully processed:
    /// eviction notifications first, then queries, then data requests.
    /// Returns the number of messages written.
    pub async fn write_sync_messages<W: AsyncWrite + Unpin>(
        &mut self,
        out: &mut RfbOutStream<W>,
    ) -> Result<usize, SessionError> {
        let mut written = 0;
        let (session_evictions, persistent_evictions) = self.engine.take_pending_evictions();

        for chunk in session_evictions.chunks(MAX_IDS_PER_MESSAGE) {
            CacheEviction::new(chunk.to_vec()).write_to(out)?;
            written += 1;
        }
        for chunk in persistent_evictions.chunks(MAX_IDS_PER_MESSAGE) {
            let hashes = chunk.iter().map(|h| h.to_vec()).collect();
            PersistentCacheEviction::new(hashes).write_to(out)?;
            written += 1;
        }

        let queries = self.engine.take_pending_queries();
        for chunk in queries.chunks(MAX_IDS_PER_MESSAGE) {
            let hashes = chunk.iter().map(|h| h.to_vec()).collect();
            PersistentCacheQuery::new(hashes).write_to(out)?;
            written += 1;
        }

        for id in self.engine.take_pending_data_requests() {
            RequestCachedData::new(id).write_to(out)?;
            written += 1;
        }

        out.flush().await?;
        Ok(written)
    }

    /// Advertise the persistent inventory to a fresh server, in chunked
    /// hash-list messages sharing one sequence id. Returns the number of
    /// chunks sent.
    pub async fn send_inventory<W: AsyncWrite + Unpin>(
        &mut self,
        out: &mut RfbOutStream<W>,
    ) -> Result<usize, SessionError> {
        let chunks = self.engine.inventory_chunks(MAX_IDS_PER_MESSAGE);
        if chunks.is_empty() {
            return Ok(0);
        }
        self.inventory_seq = self.inventory_seq.wrapping_add(1);
        let total = chunks.len() as u16;
        let sent = chunks.len();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let hashes = chunk.iter().map(|h| h.to_vec()).collect();
            PersistentCacheHashList::new(self.inventory_seq, total, index as u16, hashes)
                .write_to(out)?;
        }
        out.flush().await?;
        Ok(sent)
    }
}

fn fixed_hash(hash: &[u8]) -> Option<[u8; 16]> {
    if hash.len() == 16 {
        let mut fixed = [0u8; 16];
        fixed.copy_from_slice(hash);
        Some(fixed)
    } else {
        None
    }
}
