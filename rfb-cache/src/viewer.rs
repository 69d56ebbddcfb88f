//! Viewer-side cache engine.
//!
//! Owned by the decode pipeline and single-threaded by contract. Incoming
//! cache rectangles either blit straight from the session ARC / persistent
//! tier or decode-and-store; outgoing eviction notifications, data
//! requests, and queries accumulate in outboxes the client's event loop
//! drains once per update cycle, after the frame is fully processed.
//!
//! The persistent tier lives behind the [`PersistentTier`] trait; the
//! `rfb-persist` crate provides the disk-backed implementation. Every
//! lookup is dimension-matched: a stored entry is only returned for a
//! rectangle of identical width and height.

use crate::arc::{ArcCache, ArcStats};
use crate::codec::Codec;
use crate::config::CacheConfig;
use crate::entry::CacheEntry;
use crate::error::CacheError;
use crate::hasher::ContentHasher;
use crate::key::{CacheKey, QualityCode};
use rfb_common::Rect;
use rfb_pixelbuffer::MutablePixelBuffer;
use std::time::Instant;

/// A decoded entry exchanged with the persistent tier. Pixels are always
/// canonical and tightly packed.
#[derive(Debug, Clone)]
pub struct TierEntry {
    pub pixels: Vec<u8>,
    pub width: u16,
    pub height: u16,
    /// Session-level hash of the stored pixels.
    pub actual_hash: u64,
    pub quality: QualityCode,
}

/// The disk-backed persistent cache as seen by the viewer engine.
///
/// Implementations take `&self` and synchronize internally; the engine may
/// be driven from the decode thread while hydration and coordination
/// threads touch the same store.
pub trait PersistentTier: Send {
    /// Dimension-matched lookup by canonical hash.
    fn lookup(&self, hash: &[u8; 16], width: u16, height: u16) -> Option<TierEntry>;

    /// Store an entry under its canonical hash. `persistable` is false when
    /// the entry must stay memory-only (e.g. the coordinator refused the
    /// write).
    fn insert(&self, hash: [u8; 16], entry: TierEntry, persistable: bool);

    /// Whether the hash is present (hot or cold).
    fn contains(&self, hash: &[u8; 16]) -> bool;

    /// Drain hashes dropped since the last call (capacity evictions and
    /// corruption discards) for outbound eviction notification.
    fn take_evicted(&self) -> Vec<[u8; 16]>;

    /// All hashes currently held, for the session-start inventory.
    fn inventory(&self) -> Vec<[u8; 16]>;
}

impl<T: PersistentTier + Sync + ?Sized> PersistentTier for std::sync::Arc<T> {
    fn lookup(&self, hash: &[u8; 16], width: u16, height: u16) -> Option<TierEntry> {
        T::lookup(self, hash, width, height)
    }

    fn insert(&self, hash: [u8; 16], entry: TierEntry, persistable: bool) {
        T::insert(self, hash, entry, persistable);
    }

    fn contains(&self, hash: &[u8; 16]) -> bool {
        T::contains(self, hash)
    }

    fn take_evicted(&self) -> Vec<[u8; 16]> {
        T::take_evicted(self)
    }

    fn inventory(&self) -> Vec<[u8; 16]> {
        T::inventory(self)
    }
}

/// Viewer cache engine: session ARC plus optional persistent tier.
pub struct ViewerCacheEngine {
    session: ArcCache<CacheKey, CacheEntry>,
    hasher: ContentHasher,
    persistent: Option<Box<dyn PersistentTier>>,

    pending_evictions: Vec<u64>,
    pending_data_requests: Vec<u64>,
    pending_queries: Vec<[u8; 16]>,

    /// Minimum colour depth a canonical-hash hit must satisfy; hits below
    /// it are refused so the server re-sends at higher quality.
    min_bpp: u8,

    epoch: Instant,
}

impl ViewerCacheEngine {
    pub fn new(config: &CacheConfig, hasher: ContentHasher) -> Self {
        Self {
            session: ArcCache::new(config.memory_bytes()),
            hasher,
            persistent: None,
            pending_evictions: Vec::new(),
            pending_data_requests: Vec::new(),
            pending_queries: Vec::new(),
            min_bpp: 0,
            epoch: Instant::now(),
        }
    }

    /// Attach the disk-backed tier.
    pub fn with_persistent_tier(mut self, tier: Box<dyn PersistentTier>) -> Self {
        self.persistent = Some(tier);
        self
    }

    /// Refuse canonical-hash hits below this colour depth.
    pub fn set_min_bpp(&mut self, min_bpp: u8) {
        self.min_bpp = min_bpp;
    }

    fn now_secs(&self) -> u32 {
        self.epoch.elapsed().as_secs() as u32
    }

    /// Handle a session cache reference.
    ///
    /// On a hit the cached pixels are blitted at the rectangle's position
    /// and `true` is returned. On a miss the rectangle is left undisplayed,
    /// a data request is queued for the server, and `false` is returned.
    pub fn on_cached_rect_ref(
        &mut self,
        rect: Rect,
        cache_id: u64,
        fb: &mut dyn MutablePixelBuffer,
    ) -> Result<bool, CacheError> {
        let key = CacheKey::new(rect.width as u16, rect.height as u16, cache_id);
        let now = self.now_secs();

        if let Some(entry) = self.session.peek_mut(&key) {
            entry.touch(now);
        }
        let Some(entry) = self.session.get(&key) else {
            tracing::warn!(
                "session cache miss: id={:#x} for {}x{} at ({},{})",
                cache_id,
                rect.width,
                rect.height,
                rect.x,
                rect.y
            );
            self.pending_data_requests.push(cache_id);
            return Ok(false);
        };

        let pixels = entry.pixels.clone();
        blit_canonical(fb, rect, &pixels)?;
        tracing::debug!(
            "session cache hit: id={:#x}, {} bytes blitted at ({},{})",
            cache_id,
            pixels.len(),
            rect.x,
            rect.y
        );
        Ok(true)
    }

    /// Handle a session cache init: decode, store under the id, blit.
    ///
    /// A payload that fails to decode, or decodes to the wrong geometry, is
    /// rejected; nothing is stored and the error is reported for logging.
    pub fn on_cached_rect_init(
        &mut self,
        rect: Rect,
        cache_id: u64,
        inner_encoding: i32,
        payload: &[u8],
        fb: &mut dyn MutablePixelBuffer,
    ) -> Result<(), CacheError> {
        let width = rect.width as u16;
        let height = rect.height as u16;
        let codec = Codec::from_encoding_id(inner_encoding).ok_or_else(|| {
            CacheError::Codec(anyhow::anyhow!(
                "unknown inner encoding {} for cached rect init",
                inner_encoding
            ))
        })?;

        let canonical = match codec.decode(payload, width, height) {
            Ok(c) => c,
            Err(err) => {
                tracing::warn!("dropping cached rect init id={:#x}: {}", cache_id, err);
                return Err(err);
            }
        };

        // The id is the hash of what this viewer now sees; verify our own
        // arithmetic agrees before trusting the entry.
        let observed = self
            .hasher
            .hash_canonical(&canonical, width as u32, height as u32);

        let now = self.now_secs();
        let entry = if observed == cache_id {
            CacheEntry::new_lossless(canonical.clone(), width, height, cache_id, now)
        } else {
            CacheEntry::new_lossy(canonical.clone(), width, height, cache_id, observed, now)
        };

        let bytes = entry.bytes();
        let key = CacheKey::new(width, height, cache_id);
        match self.session.insert(key, entry, bytes) {
            Ok(_evicted) => self.collect_session_evictions(),
            Err(err) => {
                tracing::warn!("cannot cache id={:#x}: {}", cache_id, err);
            }
        }

        blit_canonical(fb, rect, &canonical)
    }

    /// Handle a persistent cache reference by canonical hash.
    pub fn on_persistent_rect_ref(
        &mut self,
        rect: Rect,
        hash: [u8; 16],
        fb: &mut dyn MutablePixelBuffer,
    ) -> Result<bool, CacheError> {
        let width = rect.width as u16;
        let height = rect.height as u16;

        let hit = self
            .persistent
            .as_ref()
            .and_then(|tier| tier.lookup(&hash, width, height));

        let Some(entry) = hit else {
            tracing::warn!(
                "persistent cache miss: hash={:02x?} for {}x{}",
                &hash[..4],
                width,
                height
            );
            self.pending_queries.push(hash);
            return Ok(false);
        };

        // A hit below the required depth is refused so the server sends a
        // higher-quality init instead.
        if self.min_bpp > 0 && entry.quality.min_bpp() < self.min_bpp {
            self.pending_queries.push(hash);
            return Ok(false);
        }

        blit_canonical(fb, rect, &entry.pixels)?;
        Ok(true)
    }

    /// Handle a persistent init: decode, store in the tier (and on disk),
    /// blit.
    pub fn on_persistent_rect_init(
        &mut self,
        rect: Rect,
        hash: [u8; 16],
        inner_encoding: i32,
        payload: &[u8],
        fb: &mut dyn MutablePixelBuffer,
    ) -> Result<(), CacheError> {
        let width = rect.width as u16;
        let height = rect.height as u16;
        let codec = Codec::from_encoding_id(inner_encoding).ok_or_else(|| {
            CacheError::Codec(anyhow::anyhow!(
                "unknown inner encoding {} for persistent init",
                inner_encoding
            ))
        })?;

        let canonical = match codec.decode(payload, width, height) {
            Ok(c) => c,
            Err(err) => {
                tracing::warn!("dropping persistent init hash={:02x?}: {}", &hash[..4], err);
                return Err(err);
            }
        };

        let actual_hash = self
            .hasher
            .hash_canonical(&canonical, width as u32, height as u32);
        // Lossless exactly when the bytes we decoded hash to the canonical
        // hash the server claimed.
        let lossless = self
            .hasher
            .persistent_hash_canonical(&canonical, width as u32, height as u32)
            .is_some_and(|observed| observed == hash);

        if let Some(tier) = self.persistent.as_ref() {
            tier.insert(
                hash,
                TierEntry {
                    pixels: canonical.clone(),
                    width,
                    height,
                    actual_hash,
                    quality: QualityCode::new(lossless, 32),
                },
                true,
            );
        }

        blit_canonical(fb, rect, &canonical)
    }

    /// Session ids and persistent hashes evicted since the last call, in
    /// that order, for the outgoing eviction messages.
    pub fn take_pending_evictions(&mut self) -> (Vec<u64>, Vec<[u8; 16]>) {
        let session = std::mem::take(&mut self.pending_evictions);
        let persistent = self
            .persistent
            .as_ref()
            .map(|tier| tier.take_evicted())
            .unwrap_or_default();
        (session, persistent)
    }

    /// Data requests queued by session-cache misses.
    pub fn take_pending_data_requests(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.pending_data_requests)
    }

    /// Hash queries queued by persistent-cache misses.
    pub fn take_pending_queries(&mut self) -> Vec<[u8; 16]> {
        std::mem::take(&mut self.pending_queries)
    }

    /// The persistent inventory in hash-list chunks for session-start
    /// priming.
    pub fn inventory_chunks(&self, chunk_size: usize) -> Vec<Vec<[u8; 16]>> {
        let Some(tier) = self.persistent.as_ref() else {
            return Vec::new();
        };
        let inventory = tier.inventory();
        inventory
            .chunks(chunk_size.max(1))
            .map(|c| c.to_vec())
            .collect()
    }

    pub fn session_stats(&self) -> ArcStats {
        self.session.stats()
    }

    fn collect_session_evictions(&mut self) {
        for key in self.session.take_pending_evictions() {
            self.pending_evictions.push(key.hash);
        }
    }
}

fn blit_canonical(
    fb: &mut dyn MutablePixelBuffer,
    rect: Rect,
    canonical: &[u8],
) -> Result<(), CacheError> {
    let native = fb.pixel_format().from_canonical_rect(
        canonical,
        rect.width as usize,
        rect.height as usize,
    )?;
    fb.image_rect(rect, &native, 0)?;
    Ok(())
}
