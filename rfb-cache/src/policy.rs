//! Per-rectangle encoder decision procedure.
//!
//! For every rectangle in an outgoing update the policy hashes the content
//! and resolves, against the engine's id sets, whether to encode normally,
//! reference cached content, or transmit an init. Lossy codecs get the
//! dual-hash treatment: the server round-trips its own encoded output so it
//! knows the hash the viewer will compute after decode, and can reference
//! whichever identifier the viewer is confirmed to hold.
//!
//! First-seen content is encoded normally this cycle; a seeding init is
//! queued on the engine for the *next* cycle, so the id is never announced
//! before the bytes that define it are on the wire.

use crate::codec::Codec;
use crate::entry::CacheEntry;
use crate::hasher::{ContentHasher, NULL_HASH};
use crate::key::CacheKey;
use crate::server::ServerCacheEngine;
use rfb_common::Rect;
use rfb_pixelbuffer::PixelBuffer;

/// The action the encoder takes for one rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeAction {
    /// Encode with the normal pipeline. A seeding init may have been queued
    /// on the engine for the next cycle.
    Normal,
    /// Send a session cache reference.
    SendRef { id: u64 },
    /// Send a session init with the payload; register the id as pending
    /// after the write.
    SendInit { id: u64 },
    /// Send a persistent cache reference.
    SendPersistentRef { hash: [u8; 16] },
    /// Send a persistent init with the payload.
    SendPersistentInit { hash: [u8; 16] },
}

/// Stateless-per-rectangle decision procedure over a shared hasher.
pub struct EncoderPolicy {
    hasher: ContentHasher,
}

impl EncoderPolicy {
    pub fn new(hasher: ContentHasher) -> Self {
        Self { hasher }
    }

    pub fn hasher(&self) -> &ContentHasher {
        &self.hasher
    }

    /// In-framebuffer CopyRect references currently-displayed pixels while
    /// the cache references historical content; mixing the two corrupts
    /// the display. CopyRect is only allowed when no cache face is active.
    pub fn allows_copyrect(&self, engine: &ServerCacheEngine) -> bool {
        !engine.session_capable() && !engine.persistent_capable()
    }

    /// Decide what to send for `rect`, to be encoded with `codec` if the
    /// normal path is taken.
    ///
    /// Side effects on the engine: lossy mappings are recorded, content is
    /// stored for future inits, reference positions are tracked, and
    /// first-seen seeds are queued. The caller remains responsible for
    /// `register_pending` after writing an init and `confirm_pending` after
    /// a successful flush.
    pub fn decide(
        &self,
        engine: &mut ServerCacheEngine,
        pb: &dyn PixelBuffer,
        rect: Rect,
        codec: &Codec,
    ) -> EncodeAction {
        let session = engine.session_capable();
        let persistent = engine.persistent_capable();
        if !session && !persistent {
            return EncodeAction::Normal;
        }
        if !rect.is_eligible(engine.min_rect_pixels()) {
            return EncodeAction::Normal;
        }
        let width = rect.width as u16;
        let height = rect.height as u16;

        let Ok(canonical_bytes) = pb.canonical_rect(rect) else {
            return EncodeAction::Normal;
        };
        let canonical = self
            .hasher
            .hash_canonical(&canonical_bytes, rect.width, rect.height);
        if canonical == NULL_HASH {
            return EncodeAction::Normal;
        }

        // For lossy codecs, round-trip our own output so we know the hash
        // the viewer will compute after decoding it.
        let (actual, entry) = if codec.is_lossy() {
            match self.lossy_round_trip(&canonical_bytes, width, height, canonical, codec, engine) {
                Some(pair) => pair,
                None => return EncodeAction::Normal,
            }
        } else {
            let entry = CacheEntry::new_lossless(
                canonical_bytes.clone(),
                width,
                height,
                canonical,
                engine.now_secs(),
            );
            (canonical, entry)
        };

        // Remember the content regardless of outcome so a future init or a
        // miss-recovery re-init can be produced without another
        // framebuffer read.
        let key = CacheKey::new(width, height, actual);
        if let Err(err) = engine.store_entry(key, entry) {
            tracing::debug!("rect {:?} not cacheable: {}", rect, err);
            return EncodeAction::Normal;
        }

        let phash = if persistent {
            self.hasher
                .persistent_hash_canonical(&canonical_bytes, rect.width, rect.height)
        } else {
            None
        };

        // Reference what the viewer is confirmed to hold, best quality
        // first; the persistent face wins when a canonical hash exists.
        if let Some(hash) = phash {
            if engine.viewer_knows_hash(&hash) {
                engine
                    .stats
                    .record_persistent_ref(rect.area(), 4, codec.encoding_id(), hash.len() as u64);
                return EncodeAction::SendPersistentRef { hash };
            }
        }
        if session && engine.viewer_knows(canonical) {
            engine.record_ref(canonical, rect);
            engine
                .stats
                .record_session_ref(rect.area(), 4, codec.encoding_id());
            return EncodeAction::SendRef { id: canonical };
        }
        if session && engine.viewer_knows(actual) {
            engine.record_ref(actual, rect);
            engine
                .stats
                .record_session_ref(rect.area(), 4, codec.encoding_id());
            return EncodeAction::SendRef { id: actual };
        }

        // The viewer explicitly asked for one of these identifiers: answer
        // with the payload this cycle.
        if let Some(hash) = phash {
            if engine.viewer_requested_hash(&hash) {
                return EncodeAction::SendPersistentInit { hash };
            }
        }
        if session && engine.viewer_requested(canonical) {
            return EncodeAction::SendInit { id: canonical };
        }
        if session && engine.viewer_requested(actual) {
            return EncodeAction::SendInit { id: actual };
        }

        // First-seen: encode normally now, seed the cache next cycle with
        // the identifier matching what the viewer will end up seeing. An
        // id whose init is already in flight is not re-seeded.
        if let Some(hash) = phash {
            if !engine.hash_pending(&hash) {
                engine.enqueue_persistent_init(hash, rect);
            }
        } else if session && !engine.id_pending(actual) {
            engine.enqueue_init(actual, rect);
        }
        EncodeAction::Normal
    }

    fn lossy_round_trip(
        &self,
        canonical_bytes: &[u8],
        width: u16,
        height: u16,
        canonical: u64,
        codec: &Codec,
        engine: &mut ServerCacheEngine,
    ) -> Option<(u64, CacheEntry)> {
        let encoded = match codec.encode(canonical_bytes, width, height) {
            Ok(e) => e,
            Err(err) => {
                tracing::warn!("lossy encode failed, rect not cached: {}", err);
                return None;
            }
        };
        let decoded = match codec.decode(&encoded, width, height) {
            Ok(d) => d,
            Err(err) => {
                tracing::warn!("lossy round-trip decode failed, rect not cached: {}", err);
                return None;
            }
        };
        let actual = self
            .hasher
            .hash_canonical(&decoded, width as u32, height as u32);
        if actual == NULL_HASH {
            return None;
        }
        engine.record_lossy_mapping(canonical, actual);

        let mut entry =
            CacheEntry::new_lossy(decoded, width, height, canonical, actual, engine.now_secs());
        entry.encoded = Some(encoded);
        Some((actual, entry))
    }

    /// Produce the payload for an init of `id` at the given geometry, e.g.
    /// when draining the pending-init queue or answering a data request.
    ///
    /// A retained lossy payload is reused verbatim (re-encoding would shift
    /// the hash); otherwise the stored pixels are encoded with `codec`,
    /// which must be lossless.
    pub fn init_payload(
        &self,
        engine: &mut ServerCacheEngine,
        id: u64,
        width: u16,
        height: u16,
        codec: &Codec,
    ) -> Option<(i32, Vec<u8>)> {
        let (pixels, retained) = {
            let entry = engine.entry_for(id, width, height)?;
            (entry.pixels.clone(), entry.encoded.clone())
        };
        if let Some(encoded) = retained {
            return Some((codec.encoding_id(), encoded));
        }
        debug_assert!(!codec.is_lossy(), "lossless re-encode required");
        let payload = codec.encode(&pixels, width, height).ok()?;
        Some((codec.encoding_id(), payload))
    }
}
