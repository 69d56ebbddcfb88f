//! Per-connection server cache engine.
//!
//! Owned by exactly one connection handler and accessed from that handler's
//! thread only; it holds no locks. The engine tracks what the viewer is
//! confirmed to hold (`known`), what has been sent this cycle but not yet
//! flushed (`pending`), and what the viewer has explicitly asked for
//! (`requested`). The synchronization discipline is strict:
//!
//! - an id becomes `known` only after the init carrying it has been written
//!   to the wire for the current update ([`confirm_pending`]);
//! - inits discovered mid-cycle are queued and emitted at the start of the
//!   *next* cycle ([`enqueue_init`] / [`take_pending_inits`]);
//! - a `RequestCachedData` from the viewer demotes the id back to
//!   `requested` and schedules a targeted refresh of the last rectangle the
//!   id was referenced at, never a full-screen refresh.
//!
//! [`confirm_pending`]: ServerCacheEngine::confirm_pending
//! [`enqueue_init`]: ServerCacheEngine::enqueue_init
//! [`take_pending_inits`]: ServerCacheEngine::take_pending_inits

use crate::arc::{ArcCache, ArcStats};
use crate::config::CacheConfig;
use crate::entry::CacheEntry;
use crate::error::CacheError;
use crate::hasher::NULL_HASH;
use crate::key::CacheKey;
use crate::stats::BandwidthStats;
use rfb_common::Rect;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

/// What the engine wants done with a rectangle whose key is already known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Cache does not apply; encode normally.
    NotEligible,
    /// The viewer holds this id: send a reference.
    HitRef(u64),
    /// The viewer asked for this id: send an init with the payload.
    MissSendInit(u64),
}

/// Server-side cache state for one viewer connection.
pub struct ServerCacheEngine {
    enabled: bool,
    min_rect_pixels: u64,
    max_age_seconds: u32,

    /// Content the server remembers, for producing init payloads.
    cache: ArcCache<CacheKey, CacheEntry>,

    /// Ids the viewer has confirmed holding.
    known_ids: HashSet<u64>,
    /// Ids whose init was written this cycle but not yet flushed.
    pending_confirmation: HashSet<u64>,
    /// Ids the viewer has explicitly asked the server to (re)send.
    requested_ids: HashSet<u64>,

    /// Canonical hash to post-decode hash, for lossy encodings.
    lossy_map: HashMap<u64, u64>,

    /// Last rectangle each id was referenced or initialized at, for
    /// targeted miss recovery.
    last_ref_rect: HashMap<u64, Rect>,

    /// Inits to emit at the start of the next update cycle.
    pending_init_queue: VecDeque<(u64, Rect)>,
    /// Persistent inits to emit at the start of the next update cycle.
    pending_persistent_init_queue: VecDeque<([u8; 16], Rect)>,

    /// Persistent-cache hashes the viewer holds (primed from the hash-list
    /// inventory and grown as persistent inits are confirmed).
    known_hashes: HashSet<[u8; 16]>,
    /// Persistent hashes the viewer has queried for.
    requested_hashes: HashSet<[u8; 16]>,
    /// Persistent hashes whose init was written this cycle.
    pending_hashes: HashSet<[u8; 16]>,

    /// Capabilities advertised by the viewer via pseudo-encodings.
    session_capable: bool,
    persistent_capable: bool,

    /// Bandwidth accounting for the shutdown summary.
    pub stats: BandwidthStats,

    epoch: Instant,
}

impl ServerCacheEngine {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            min_rect_pixels: config.min_rect_size_pixels as u64,
            max_age_seconds: config.max_age_seconds,
            cache: ArcCache::new(config.memory_bytes()),
            known_ids: HashSet::new(),
            pending_confirmation: HashSet::new(),
            requested_ids: HashSet::new(),
            lossy_map: HashMap::new(),
            last_ref_rect: HashMap::new(),
            pending_init_queue: VecDeque::new(),
            pending_persistent_init_queue: VecDeque::new(),
            known_hashes: HashSet::new(),
            requested_hashes: HashSet::new(),
            pending_hashes: HashSet::new(),
            session_capable: false,
            persistent_capable: false,
            stats: BandwidthStats::default(),
            epoch: Instant::now(),
        }
    }

    /// Record the capabilities the viewer advertised in its encodings list.
    /// No cache message may be sent for a face the viewer did not advertise.
    pub fn set_capabilities(&mut self, session: bool, persistent: bool) {
        self.session_capable = session;
        self.persistent_capable = persistent;
    }

    pub fn session_capable(&self) -> bool {
        self.enabled && self.session_capable
    }

    pub fn persistent_capable(&self) -> bool {
        self.enabled && self.persistent_capable
    }

    /// Engine-relative wall clock in seconds, for TTL and access ordering.
    pub fn now_secs(&self) -> u32 {
        self.epoch.elapsed().as_secs() as u32
    }

    /// Is a rectangle of this size worth caching at all?
    pub fn eligible(&self, width: u16, height: u16) -> bool {
        self.session_capable() && (width as u64 * height as u64) >= self.min_rect_pixels
    }

    /// Single-key decision per the session protocol. The encoder policy
    /// layers the dual-hash resolution on top of this.
    pub fn lookup(&mut self, key: &CacheKey) -> Decision {
        if key.hash == NULL_HASH || !self.eligible(key.width, key.height) {
            return Decision::NotEligible;
        }
        if self.known_ids.contains(&key.hash) {
            return Decision::HitRef(key.hash);
        }
        if self.requested_ids.contains(&key.hash) {
            return Decision::MissSendInit(key.hash);
        }
        Decision::NotEligible
    }

    pub fn viewer_knows(&self, id: u64) -> bool {
        self.known_ids.contains(&id)
    }

    pub fn viewer_requested(&self, id: u64) -> bool {
        self.requested_ids.contains(&id)
    }

    /// Whether an init for this id is awaiting flush confirmation.
    pub fn id_pending(&self, id: u64) -> bool {
        self.pending_confirmation.contains(&id)
    }

    /// Whether a persistent init for this hash is awaiting confirmation.
    pub fn hash_pending(&self, hash: &[u8; 16]) -> bool {
        self.pending_hashes.contains(hash)
    }

    pub fn viewer_knows_hash(&self, hash: &[u8; 16]) -> bool {
        self.known_hashes.contains(hash)
    }

    pub fn viewer_requested_hash(&self, hash: &[u8; 16]) -> bool {
        self.requested_hashes.contains(hash)
    }

    /// Mark an id as confirmed held by the viewer.
    pub fn register_known(&mut self, id: u64) {
        self.known_ids.insert(id);
        self.requested_ids.remove(&id);
    }

    /// An init for `id` has been written into the current update. The id is
    /// promoted to `known` only when the update flush succeeds.
    pub fn register_pending(&mut self, id: u64, rect: Rect) {
        self.pending_confirmation.insert(id);
        self.requested_ids.remove(&id);
        self.last_ref_rect.insert(id, rect);
    }

    /// A persistent init has been written into the current update.
    pub fn register_pending_hash(&mut self, hash: [u8; 16]) {
        self.pending_hashes.insert(hash);
        self.requested_hashes.remove(&hash);
    }

    /// The update containing pending inits was flushed to the wire: promote
    /// them to `known`.
    pub fn confirm_pending(&mut self) {
        for id in self.pending_confirmation.drain() {
            self.known_ids.insert(id);
        }
        for hash in self.pending_hashes.drain() {
            self.known_hashes.insert(hash);
        }
    }

    /// Drop an unflushed pending id (flush failed or viewer asked again);
    /// it will be re-sent on a later cycle.
    pub fn drop_pending(&mut self, id: u64) {
        self.pending_confirmation.remove(&id);
    }

    /// The update carrying the pending inits never reached the wire: drop
    /// them all so the content re-seeds on a later cycle.
    pub fn abort_pending(&mut self) {
        self.pending_confirmation.clear();
        self.pending_hashes.clear();
    }

    /// Record that a reference to `id` was sent for `rect`.
    ///
    /// The server must never reference an id the viewer is not confirmed to
    /// hold.
    pub fn record_ref(&mut self, id: u64, rect: Rect) {
        debug_assert!(
            self.known_ids.contains(&id),
            "reference to id {:#x} the viewer does not hold",
            id
        );
        self.last_ref_rect.insert(id, rect);
    }

    /// Record the canonical-to-actual hash mapping of a lossy encode.
    pub fn record_lossy_mapping(&mut self, canonical: u64, actual: u64) {
        if canonical != NULL_HASH && actual != NULL_HASH {
            self.lossy_map.insert(canonical, actual);
        }
    }

    /// The post-decode hash previously recorded for a canonical hash.
    pub fn query_lossy(&self, canonical: u64) -> Option<u64> {
        self.lossy_map.get(&canonical).copied()
    }

    /// Viewer evicted session entries: stop referencing them. The server's
    /// own copy of the content stays cached so a later init can re-seed the
    /// viewer without re-reading the framebuffer.
    pub fn on_viewer_eviction(&mut self, ids: &[u64]) {
        for id in ids {
            self.known_ids.remove(id);
            self.pending_confirmation.remove(id);
            self.requested_ids.remove(id);
        }
    }

    /// Viewer evicted persistent entries.
    pub fn on_viewer_hash_eviction(&mut self, hashes: &[[u8; 16]]) {
        for hash in hashes {
            self.known_hashes.remove(hash);
            self.pending_hashes.remove(hash);
            self.requested_hashes.remove(hash);
        }
    }

    /// Viewer asked whether these session ids can be (re)sent: the next
    /// cycle will answer with inits where content is available.
    pub fn on_viewer_query(&mut self, ids: &[u64]) {
        for id in ids {
            if !self.known_ids.contains(id) {
                self.requested_ids.insert(*id);
            }
        }
    }

    /// Viewer queried persistent hashes it is missing.
    pub fn on_viewer_hash_query(&mut self, hashes: &[[u8; 16]]) {
        for hash in hashes {
            if !self.known_hashes.contains(hash) {
                self.requested_hashes.insert(*hash);
            }
        }
    }

    /// One chunk of the viewer's persistent inventory: prime the known set.
    pub fn on_hash_list(&mut self, hashes: &[[u8; 16]]) {
        self.known_hashes.extend(hashes.iter().copied());
    }

    /// The viewer reported a miss on a referenced id. Demote it and return
    /// the rectangle to refresh, if one was recorded.
    pub fn on_request_cached_data(&mut self, id: u64) -> Option<Rect> {
        self.known_ids.remove(&id);
        self.pending_confirmation.remove(&id);
        self.requested_ids.insert(id);
        let rect = self.last_ref_rect.get(&id).copied();
        if let Some(rect) = rect {
            self.enqueue_init(id, rect);
        }
        rect
    }

    /// Remember content so a later init for the same key can be produced.
    pub fn store_entry(&mut self, key: CacheKey, entry: CacheEntry) -> Result<(), CacheError> {
        if entry.width != key.width || entry.height != key.height {
            // Structurally impossible given how keys are built; asserted
            // against regressions.
            debug_assert!(false, "entry dimensions disagree with key");
            return Err(CacheError::DimensionMismatch {
                entry_width: entry.width,
                entry_height: entry.height,
                rect_width: key.width,
                rect_height: key.height,
            });
        }
        entry.validate()?;
        let bytes = entry.bytes();
        self.cache.insert(key, entry, bytes)?;
        // Server-side evictions need no wire notification.
        let _ = self.cache.take_pending_evictions();
        Ok(())
    }

    /// Fetch the entry for an id at the given geometry, honoring the TTL.
    pub fn entry_for(&mut self, id: u64, width: u16, height: u16) -> Option<&CacheEntry> {
        let key = CacheKey::new(width, height, id);
        if self.max_age_seconds > 0 {
            let now = self.now_secs();
            let expired = self
                .cache
                .peek(&key)
                .is_some_and(|e| now.saturating_sub(e.last_access) > self.max_age_seconds);
            if expired {
                self.cache.remove(&key);
                return None;
            }
        }
        let now = self.now_secs();
        if let Some(entry) = self.cache.peek_mut(&key) {
            entry.touch(now);
        }
        self.cache.get(&key)
    }

    /// Queue an init for emission at the start of the next update cycle.
    pub fn enqueue_init(&mut self, id: u64, rect: Rect) {
        if !self.pending_init_queue.iter().any(|(queued, _)| *queued == id) {
            self.pending_init_queue.push_back((id, rect));
        }
    }

    /// Drain the inits queued for this cycle. Emitted before any references
    /// that might depend on them.
    pub fn take_pending_inits(&mut self) -> Vec<(u64, Rect)> {
        self.pending_init_queue.drain(..).collect()
    }

    /// Queue a persistent init for the next update cycle.
    pub fn enqueue_persistent_init(&mut self, hash: [u8; 16], rect: Rect) {
        if !self
            .pending_persistent_init_queue
            .iter()
            .any(|(queued, _)| *queued == hash)
        {
            self.pending_persistent_init_queue.push_back((hash, rect));
        }
    }

    /// Drain the persistent inits queued for this cycle.
    pub fn take_pending_persistent_inits(&mut self) -> Vec<([u8; 16], Rect)> {
        self.pending_persistent_init_queue.drain(..).collect()
    }

    /// Minimum rectangle area eligible for caching, in pixels.
    pub fn min_rect_pixels(&self) -> u64 {
        self.min_rect_pixels
    }

    pub fn cache_stats(&self) -> ArcStats {
        self.cache.stats()
    }
}
