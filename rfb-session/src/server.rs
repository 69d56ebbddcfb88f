//! Server-side session: turns engine decisions into framebuffer updates
//! and feeds viewer control messages back into the engine.

use crate::error::SessionError;
use crate::payload;
use rfb_cache::{
    CacheConfig, Codec, ContentHasher, EncodeAction, EncoderPolicy, HashConfig, ServerCacheEngine,
};
use rfb_common::Rect;
use rfb_pixelbuffer::PixelBuffer;
use rfb_protocol::io::{RfbInStream, RfbOutStream};
use rfb_protocol::messages::cache::{
    CachedRect, CachedRectInit, PersistentCachedRect, PersistentCachedRectInit,
};
use rfb_protocol::messages::control::{
    CacheEviction, PersistentCacheEviction, PersistentCacheHashList, PersistentCacheQuery,
    RequestCachedData, MSG_CACHE_EVICTION, MSG_PERSISTENT_CACHE_EVICTION,
    MSG_PERSISTENT_CACHE_HASH_LIST, MSG_PERSISTENT_CACHE_QUERY, MSG_REQUEST_CACHED_DATA,
};
use rfb_protocol::messages::types::{
    Rectangle, ENCODING_CACHED_RECT, ENCODING_CACHED_RECT_INIT, ENCODING_PERSISTENT_CACHED_RECT,
    ENCODING_PERSISTENT_CACHED_RECT_INIT, PSEUDO_ENCODING_CONTENT_CACHE,
    PSEUDO_ENCODING_PERSISTENT_CACHE,
};
use tokio::io::{AsyncRead, AsyncWrite};

/// One rectangle planned for the current update.
enum Planned {
    SessionRef {
        id: u64,
        rect: Rect,
    },
    SessionInit {
        id: u64,
        rect: Rect,
        encoding: i32,
        payload: Vec<u8>,
    },
    PersistentRef {
        hash: [u8; 16],
        rect: Rect,
    },
    PersistentInit {
        hash: [u8; 16],
        rect: Rect,
        encoding: i32,
        payload: Vec<u8>,
    },
    Plain {
        rect: Rect,
        payload: Vec<u8>,
    },
}

/// Cache-aware update emission for one viewer connection.
///
/// Owned by the connection handler and driven from its thread; holds no
/// locks. The caller decides what is dirty and which codec carries plain
/// content; the session decides per rectangle whether the cache can do
/// better.
pub struct ServerSession {
    engine: ServerCacheEngine,
    policy: EncoderPolicy,
    codec: Codec,
}

impl ServerSession {
    pub fn new(cache: &CacheConfig, hash: &HashConfig, codec: Codec) -> Self {
        Self {
            engine: ServerCacheEngine::new(cache),
            policy: EncoderPolicy::new(ContentHasher::from_config(hash)),
            codec,
        }
    }

    pub fn engine(&self) -> &ServerCacheEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut ServerCacheEngine {
        &mut self.engine
    }

    /// Scan the client's SetEncodings list for the cache capability
    /// pseudo-encodings.
    pub fn handle_set_encodings(&mut self, encodings: &[i32]) {
        let session = encodings.contains(&PSEUDO_ENCODING_CONTENT_CACHE);
        let persistent = encodings.contains(&PSEUDO_ENCODING_PERSISTENT_CACHE);
        self.engine.set_capabilities(session, persistent);
    }

    /// Whether the encoder may use in-framebuffer CopyRect. Forbidden
    /// while any cache face is active.
    pub fn allows_copyrect(&self) -> bool {
        self.policy.allows_copyrect(&self.engine)
    }

    /// Emit one framebuffer update: queued inits from the previous cycle
    /// first, then the dirty rectangles. Returns the rectangle count
    /// written.
    ///
    /// On a successful flush the pending ids are promoted to known; on a
    /// failed flush they are aborted so the content re-seeds later.
    pub async fn write_update<W: AsyncWrite + Unpin>(
        &mut self,
        pb: &dyn PixelBuffer,
        dirty: &[Rect],
        out: &mut RfbOutStream<W>,
    ) -> Result<usize, SessionError> {
        let mut plan: Vec<Planned> = Vec::new();

        // Seeds queued during the previous cycle go out first, so no
        // reference in this update can depend on an id the viewer has not
        // been sent.
        for (id, rect) in self.engine.take_pending_inits() {
            match self.policy.init_payload(
                &mut self.engine,
                id,
                rect.width as u16,
                rect.height as u16,
                &self.codec,
            ) {
                Some((encoding, payload)) => plan.push(Planned::SessionInit {
                    id,
                    rect,
                    encoding,
                    payload,
                }),
                None => tracing::debug!("queued init {:#x} has no content, skipped", id),
            }
        }
        for (hash, rect) in self.engine.take_pending_persistent_inits() {
            // Content may have moved on since the seed was queued; verify
            // before announcing the hash.
            let Ok(canonical) = pb.canonical_rect(rect) else {
                continue;
            };
            let current = self.policy.hasher().persistent_hash_canonical(
                &canonical,
                rect.width,
                rect.height,
            );
            if current != Some(hash) {
                tracing::debug!("queued persistent init is stale, skipped");
                continue;
            }
            let payload = self
                .codec
                .encode(&canonical, rect.width as u16, rect.height as u16)?;
            plan.push(Planned::PersistentInit {
                hash,
                rect,
                encoding: self.codec.encoding_id(),
                payload,
            });
        }

        for &rect in dirty {
            match self.policy.decide(&mut self.engine, pb, rect, &self.codec) {
                EncodeAction::SendRef { id } => plan.push(Planned::SessionRef { id, rect }),
                EncodeAction::SendInit { id } => {
                    match self.policy.init_payload(
                        &mut self.engine,
                        id,
                        rect.width as u16,
                        rect.height as u16,
                        &self.codec,
                    ) {
                        Some((encoding, payload)) => plan.push(Planned::SessionInit {
                            id,
                            rect,
                            encoding,
                            payload,
                        }),
                        None => plan.push(self.plain(pb, rect)?),
                    }
                }
                EncodeAction::SendPersistentRef { hash } => {
                    plan.push(Planned::PersistentRef { hash, rect })
                }
                EncodeAction::SendPersistentInit { hash } => {
                    let canonical = pb
                        .canonical_rect(rect)
                        .map_err(SessionError::Other)?;
                    let payload = self
                        .codec
                        .encode(&canonical, rect.width as u16, rect.height as u16)?;
                    plan.push(Planned::PersistentInit {
                        hash,
                        rect,
                        encoding: self.codec.encoding_id(),
                        payload,
                    });
                }
                EncodeAction::Normal => plan.push(self.plain(pb, rect)?),
            }
        }

        // FramebufferUpdate header.
        out.write_u8(0);
        out.write_u8(0);
        out.write_u16(plan.len() as u16);

        let count = plan.len();
        for planned in plan {
            self.write_planned(planned, out)?;
        }

        match out.flush().await {
            Ok(()) => {
                self.engine.confirm_pending();
                Ok(count)
            }
            Err(err) => {
                self.engine.abort_pending();
                Err(err.into())
            }
        }
    }

    fn plain(&self, pb: &dyn PixelBuffer, rect: Rect) -> Result<Planned, SessionError> {
        let canonical = pb.canonical_rect(rect).map_err(SessionError::Other)?;
        let payload = self
            .codec
            .encode(&canonical, rect.width as u16, rect.height as u16)?;
        Ok(Planned::Plain { rect, payload })
    }

    fn write_planned<W: AsyncWrite + Unpin>(
        &mut self,
        planned: Planned,
        out: &mut RfbOutStream<W>,
    ) -> Result<(), SessionError> {
        match planned {
            Planned::SessionRef { id, rect } => {
                rect_header(rect, ENCODING_CACHED_RECT).write_to(out);
                CachedRect::new(id).write_to(out)?;
            }
            Planned::SessionInit {
                id,
                rect,
                encoding,
                payload,
            } => {
                rect_header(rect, ENCODING_CACHED_RECT_INIT).write_to(out);
                CachedRectInit::new(id, encoding).write_to(out)?;
                payload::write_payload(out, &self.codec, &payload);
                self.engine.register_pending(id, rect);
                self.engine
                    .stats
                    .record_session_init(payload.len() as u64 + payload::framing_overhead(&self.codec));
            }
            Planned::PersistentRef { hash, rect } => {
                rect_header(rect, ENCODING_PERSISTENT_CACHED_RECT).write_to(out);
                PersistentCachedRect::new(hash.to_vec()).write_to(out)?;
            }
            Planned::PersistentInit {
                hash,
                rect,
                encoding,
                payload,
            } => {
                rect_header(rect, ENCODING_PERSISTENT_CACHED_RECT_INIT).write_to(out);
                let len = payload.len() as u64;
                PersistentCachedRectInit::new(hash.to_vec(), encoding, payload).write_to(out)?;
                self.engine.register_pending_hash(hash);
                self.engine.stats.record_persistent_init(16, len);
            }
            Planned::Plain { rect, payload } => {
                rect_header(rect, self.codec.encoding_id()).write_to(out);
                payload::write_payload(out, &self.codec, &payload);
            }
        }
        Ok(())
    }

    /// Dispatch one client-to-server message by type byte. Returns `false`
    /// if the type is not a cache message (the caller handles it).
    pub async fn handle_client_message<R: AsyncRead + Unpin>(
        &mut self,
        message_type: u8,
        stream: &mut RfbInStream<R>,
    ) -> Result<bool, SessionError> {
        match message_type {
            MSG_CACHE_EVICTION => {
                let msg = CacheEviction::read_from(stream).await?;
                self.engine.on_viewer_eviction(&msg.ids);
            }
            MSG_PERSISTENT_CACHE_EVICTION => {
                let msg = PersistentCacheEviction::read_from(stream).await?;
                self.engine.on_viewer_hash_eviction(&fixed_hashes(&msg.hashes));
            }
            MSG_PERSISTENT_CACHE_QUERY => {
                let msg = PersistentCacheQuery::read_from(stream).await?;
                self.engine.on_viewer_hash_query(&fixed_hashes(&msg.hashes));
            }
            MSG_PERSISTENT_CACHE_HASH_LIST => {
                let msg = PersistentCacheHashList::read_from(stream).await?;
                self.engine.on_hash_list(&fixed_hashes(&msg.hashes));
            }
            MSG_REQUEST_CACHED_DATA => {
                let msg = RequestCachedData::read_from(stream).await?;
                match self.engine.on_request_cached_data(msg.cache_id) {
                    Some(rect) => tracing::debug!(
                        "cache miss reported for {:#x}, re-init targeted at {:?}",
                        msg.cache_id,
                        rect
                    ),
                    None => tracing::warn!(
                        "cache miss reported for unknown id {:#x}",
                        msg.cache_id
                    ),
                }
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Single-line bandwidth summary for the shutdown log.
    pub fn shutdown_summary(&self) -> String {
        self.engine.stats.format_summary("ContentCache")
    }
}

fn rect_header(rect: Rect, encoding: i32) -> Rectangle {
    Rectangle {
        x: rect.x as u16,
        y: rect.y as u16,
        width: rect.width as u16,
        height: rect.height as u16,
        encoding,
    }
}

/// Keep only hashes of the width this implementation uses.
fn fixed_hashes(hashes: &[Vec<u8>]) -> Vec<[u8; 16]> {
    hashes
        .iter()
        .filter_map(|h| {
            if h.len() == 16 {
                let mut fixed = [0u8; 16];
                fixed.copy_from_slice(h);
                Some(fixed)
            } else {
                tracing::warn!("ignoring {}-byte hash", h.len());
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfb_pixelbuffer::{ManagedPixelBuffer, MutablePixelBuffer, PixelFormat};
    use std::io::Cursor;

    fn session() -> ServerSession {
        let mut session = ServerSession::new(
            &CacheConfig {
                enabled: true,
                memory_mib: 64,
                min_rect_size_pixels: 4096,
                max_age_seconds: 0,
            },
            &HashConfig::default(),
            Codec::Raw,
        );
        session.handle_set_encodings(&[0, PSEUDO_ENCODING_CONTENT_CACHE]);
        session
    }

    fn fill_fb(rgb: [u8; 4]) -> ManagedPixelBuffer {
        let mut fb = ManagedPixelBuffer::new(256, 256, PixelFormat::canonical());
        let pixel = PixelFormat::canonical().from_rgb888(rgb);
        fb.fill_rect(Rect::new(0, 0, 256, 256), &pixel).unwrap();
        fb
    }

    #[test]
    fn test_capability_detection() {
        let mut session = session();
        assert!(session.engine().session_capable());
        assert!(!session.engine().persistent_capable());
        assert!(!session.allows_copyrect());

        session.handle_set_encodings(&[0, 16]);
        assert!(!session.engine().session_capable());
        assert!(session.allows_copyrect());
    }

    #[tokio::test]
    async fn test_first_update_is_plain_second_carries_init() {
        let mut session = session();
        let fb = fill_fb([1, 2, 3, 255]);
        let rect = Rect::new(0, 0, 64, 64);

        let mut wire = Vec::new();
        let mut out = RfbOutStream::new(&mut wire);
        session.write_update(&fb, &[rect], &mut out).await.unwrap();

        // Header: one plain rectangle with the raw payload.
        let mut inp = RfbInStream::new(Cursor::new(wire));
        assert_eq!(inp.read_u8().await.unwrap(), 0);
        inp.skip(1).await.unwrap();
        assert_eq!(inp.read_u16().await.unwrap(), 1);
        let header = Rectangle::read_from(&mut inp).await.unwrap();
        assert_eq!(header.encoding, Codec::Raw.encoding_id());

        // Second, empty update carries the queued seed init.
        let mut wire = Vec::new();
        let mut out = RfbOutStream::new(&mut wire);
        let count = session.write_update(&fb, &[], &mut out).await.unwrap();
        assert_eq!(count, 1);

        let mut inp = RfbInStream::new(Cursor::new(wire));
        inp.skip(2).await.unwrap();
        assert_eq!(inp.read_u16().await.unwrap(), 1);
        let header = Rectangle::read_from(&mut inp).await.unwrap();
        assert_eq!(header.encoding, ENCODING_CACHED_RECT_INIT);
        let init = CachedRectInit::read_from(&mut inp).await.unwrap();

        // The flush promoted the id: the third update references it.
        assert!(session.engine().viewer_knows(init.cache_id));
        let mut wire = Vec::new();
        let mut out = RfbOutStream::new(&mut wire);
        session.write_update(&fb, &[rect], &mut out).await.unwrap();
        let mut inp = RfbInStream::new(Cursor::new(wire));
        inp.skip(4).await.unwrap();
        let header = Rectangle::read_from(&mut inp).await.unwrap();
        assert_eq!(header.encoding, ENCODING_CACHED_RECT);
        let cached = CachedRect::read_from(&mut inp).await.unwrap();
        assert_eq!(cached.cache_id, init.cache_id);
    }

    #[tokio::test]
    async fn test_eviction_message_dispatch() {
        let mut session = session();
        session.engine_mut().register_known(42);

        let mut wire = Vec::new();
        let mut out = RfbOutStream::new(&mut wire);
        CacheEviction::new(vec![42]).write_to(&mut out).unwrap();
        out.flush().await.unwrap();

        let msg_type = wire[0];
        let mut inp = RfbInStream::new(Cursor::new(wire[1..].to_vec()));
        let handled = session.handle_client_message(msg_type, &mut inp).await.unwrap();
        assert!(handled);
        assert!(!session.engine().viewer_knows(42));
    }

    #[tokio::test]
    async fn test_unknown_message_not_handled() {
        let mut session = session();
        let mut inp = RfbInStream::new(Cursor::new(Vec::new()));
        assert!(!session.handle_client_message(3, &mut inp).await.unwrap());
    }

    #[test]
    fn test_fixed_hashes_filters_other_widths() {
        let hashes = vec![vec![1u8; 16], vec![2u8; 8], vec![3u8; 16]];
        let fixed = fixed_hashes(&hashes);
        assert_eq!(fixed.len(), 2);
        assert_eq!(fixed[0], [1u8; 16]);
        assert_eq!(fixed[1], [3u8; 16]);
    }

    #[test]
    fn test_shutdown_summary_shape() {
        let session = session();
        let summary = session.shutdown_summary();
        assert!(summary.starts_with("ContentCache:"));
    }
}
