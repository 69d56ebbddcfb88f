//! Disk-backed persistent store: hot ARC tier over sharded payload files.
//!
//! Payloads are appended to `shard_NNNN.dat` files and located through the
//! index (`index.dat`). The in-memory hot tier holds decoded entries; an
//! entry evicted from memory stays *cold* on disk until the disk capacity
//! policy reclaims it, and is re-hydrated lazily on its next lookup.
//!
//! One `parking_lot` mutex guards the tables (hot ARC, index map, shard
//! accounting, outboxes). It is held only around table mutations, never
//! across disk I/O: appends reserve their `(shard, offset)` range under the
//! lock and write outside it, which is safe because shards are strictly
//! append-only and reserved ranges never overlap.

use crate::error::PersistError;
use crate::index::{self, IndexEntry, INDEX_FILE_NAME};
use parking_lot::Mutex;
use rfb_cache::arc::ArcCache;
use rfb_cache::config::PersistentCacheConfig;
use rfb_cache::key::QualityCode;
use rfb_cache::viewer::{PersistentTier, TierEntry};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn payload_check(payload: &[u8]) -> u32 {
    let digest = Sha256::digest(payload);
    u32::from_be_bytes(digest[..4].try_into().unwrap())
}

fn shard_file_name(shard_id: u32) -> String {
    format!("shard_{:04}.dat", shard_id)
}

fn parse_shard_file_name(name: &str) -> Option<u32> {
    let rest = name.strip_prefix("shard_")?.strip_suffix(".dat")?;
    rest.parse().ok()
}

fn canonical_wire_format() -> rfb_protocol::messages::types::PixelFormat {
    rfb_protocol::messages::types::PixelFormat {
        bits_per_pixel: 32,
        depth: 24,
        big_endian: 0,
        true_color: 1,
        red_max: 255,
        green_max: 255,
        blue_max: 255,
        red_shift: 16,
        green_shift: 8,
        blue_shift: 0,
    }
}

struct StoreInner {
    hot: ArcCache<[u8; 16], TierEntry>,
    index: HashMap<[u8; 16], IndexEntry>,
    /// Live (referenced) payload bytes per shard, rebuilt from the index.
    shard_sizes: HashMap<u32, u64>,
    current_shard: u32,
    /// Append position in the current shard (actual file length).
    current_offset: u64,
    /// Cold entries, most recently demoted first, for hydrate_batch.
    cold_lru: VecDeque<[u8; 16]>,
    /// Hashes dropped since the last drain (memory evictions, corruption,
    /// disk GC), for outbound eviction notification.
    pending_evictions: Vec<[u8; 16]>,
    /// Payload appends that failed; retried by flush_dirty.
    retry_writes: HashMap<[u8; 16], (IndexEntry, Vec<u8>)>,
    /// Index has unsaved mutations.
    dirty: bool,
    /// Monotonic index mutation counter, used by the coordinator protocol.
    index_seq: u64,
}

impl StoreInner {
    fn live_disk_bytes(&self) -> u64 {
        self.shard_sizes.values().sum()
    }

    fn note_evicted(&mut self, hash: [u8; 16]) {
        self.pending_evictions.push(hash);
    }

    /// Record hot-tier evictions: disk-backed entries turn cold, the rest
    /// are gone. Either way the server is told to stop referencing them.
    fn absorb_hot_evictions(&mut self, evicted: Vec<([u8; 16], TierEntry)>) {
        for (hash, _) in evicted {
            if self.index.contains_key(&hash) {
                self.cold_lru.push_front(hash);
            }
            self.note_evicted(hash);
        }
    }

    fn forget_cold(&mut self, hash: &[u8; 16]) {
        if let Some(pos) = self.cold_lru.iter().position(|h| h == hash) {
            self.cold_lru.remove(pos);
        }
    }
}

/// The disk-backed persistent cache. Shared between the decode pipeline,
/// the hydration path, and (optionally) the coordinator.
pub struct PersistentStore {
    dir: PathBuf,
    shard_capacity: u64,
    disk_capacity: u64,
    /// True when a coordinator arbitrates this directory. Startup cleanup
    /// and shutdown persistence then belong to the elected master, not to
    /// every process that opens the store.
    coordinated: bool,
    inner: Mutex<StoreInner>,
}

impl PersistentStore {
    /// Open (or create) the cache directory: load the index, rebuild the
    /// shard accounting from it, and remove orphaned shard files.
    ///
    /// A missing or corrupt index is not fatal; the store starts empty and
    /// the orphan cleanup reclaims any stranded payload files.
    pub fn open(config: &PersistentCacheConfig) -> Result<Arc<Self>, PersistError> {
        let dir = config.directory();
        fs::create_dir_all(&dir)?;

        let index_path = dir.join(INDEX_FILE_NAME);
        let entries = if index_path.exists() {
            match index::read_index(&index_path) {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::warn!("discarding unreadable index: {}", err);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let mut index_map = HashMap::with_capacity(entries.len());
        let mut shard_sizes: HashMap<u32, u64> = HashMap::new();
        let mut cold_lru = VecDeque::with_capacity(entries.len());
        for entry in entries {
            *shard_sizes.entry(entry.shard_id).or_default() += entry.payload_size as u64;
            cold_lru.push_back(entry.hash);
            index_map.insert(entry.hash, entry);
        }

        let current_shard = index_map
            .values()
            .map(|e| e.shard_id)
            .max()
            .unwrap_or(0);
        let current_offset = fs::metadata(dir.join(shard_file_name(current_shard)))
            .map(|m| m.len())
            .unwrap_or(0);

        let store = Arc::new(Self {
            dir,
            shard_capacity: config.shard_bytes() as u64,
            disk_capacity: config.disk_bytes() as u64,
            coordinated: config.coordinate,
            inner: Mutex::new(StoreInner {
                hot: ArcCache::new(config.memory_bytes()),
                index: index_map,
                shard_sizes,
                current_shard,
                current_offset,
                cold_lru,
                pending_evictions: Vec::new(),
                retry_writes: HashMap::new(),
                dirty: false,
                index_seq: 0,
            }),
        });

        if !store.coordinated {
            store.cleanup_orphan_shards()?;
        }
        Ok(store)
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// Number of entries on disk (hot or cold).
    pub fn indexed_entries(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// Delete every `shard_NNNN.dat` not referenced by any index entry.
    ///
    /// Shard accounting is rebuilt from the index, so orphaned files would
    /// otherwise never count against the disk budget and usage would drift
    /// past the configured cap. Runs at every startup and on shutdown.
    pub fn cleanup_orphan_shards(&self) -> Result<u64, PersistError> {
        let (referenced, current_shard) = {
            let inner = self.inner.lock();
            let referenced: std::collections::HashSet<u32> =
                inner.index.values().map(|e| e.shard_id).collect();
            (referenced, inner.current_shard)
        };

        let mut reclaimed = 0u64;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(shard_id) = parse_shard_file_name(name) else {
                continue;
            };
            if !referenced.contains(&shard_id) {
                let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
                fs::remove_file(entry.path())?;
                reclaimed += len;
                tracing::debug!("removed orphan shard {} ({} bytes)", name, len);

                if shard_id == current_shard {
                    let mut inner = self.inner.lock();
                    if inner.current_shard == shard_id {
                        inner.current_offset = 0;
                    }
                }
            }
        }
        Ok(reclaimed)
    }

    /// Read and validate the payload for a cold entry, promoting it into
    /// the hot tier.
    pub fn hydrate(&self, hash: &[u8; 16]) -> Result<TierEntry, PersistError> {
        let entry = {
            let inner = self.inner.lock();
            inner.index.get(hash).cloned().ok_or(PersistError::NotFound)?
        };

        let payload = match self.read_payload(&entry) {
            Ok(payload) => payload,
            Err(err) => {
                // The disk copy is unusable: drop it and tell the server.
                let mut inner = self.inner.lock();
                inner.index.remove(hash);
                if let Some(size) = inner.shard_sizes.get_mut(&entry.shard_id) {
                    *size = size.saturating_sub(entry.payload_size as u64);
                }
                inner.forget_cold(hash);
                inner.note_evicted(*hash);
                inner.dirty = true;
                inner.index_seq += 1;
                return Err(err);
            }
        };

        let tier_entry = TierEntry {
            pixels: payload,
            width: entry.width,
            height: entry.height,
            actual_hash: entry.canonical_hash,
            quality: entry.quality,
        };

        let bytes = tier_entry.pixels.len();
        let mut inner = self.inner.lock();
        inner.forget_cold(hash);
        match inner.hot.insert(*hash, tier_entry.clone(), bytes) {
            Ok(evicted) => inner.absorb_hot_evictions(evicted),
            Err(err) => tracing::debug!("hydrated entry stays cold: {}", err),
        }
        Ok(tier_entry)
    }

    /// Prefetch up to `n` cold entries, most recently demoted first.
    /// Returns the number hydrated.
    pub fn hydrate_batch(&self, n: usize) -> usize {
        let candidates: Vec<[u8; 16]> = {
            let inner = self.inner.lock();
            inner.cold_lru.iter().take(n).copied().collect()
        };
        let mut hydrated = 0;
        for hash in candidates {
            if self.hydrate(&hash).is_ok() {
                hydrated += 1;
            }
        }
        hydrated
    }

    fn read_payload(&self, entry: &IndexEntry) -> Result<Vec<u8>, PersistError> {
        let path = self.dir.join(shard_file_name(entry.shard_id));
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(entry.payload_offset))?;
        let mut payload = vec![0u8; entry.payload_size as usize];
        file.read_exact(&mut payload)?;

        let expected =
            entry.height as usize * entry.stride_pixels as usize * 4;
        if payload.len() != expected {
            return Err(PersistError::Corrupt(format!(
                "payload is {} bytes, geometry requires {}",
                payload.len(),
                expected
            )));
        }
        if entry.payload_check != 0 && payload_check(&payload) != entry.payload_check {
            return Err(PersistError::Corrupt("payload checksum mismatch".into()));
        }
        Ok(payload)
    }

    /// Append a payload, rotating shards at the size threshold. Returns the
    /// completed index entry. Used locally and by the coordinator master on
    /// behalf of slaves.
    pub fn append_payload(
        &self,
        hash: [u8; 16],
        width: u16,
        height: u16,
        actual_hash: u64,
        quality: QualityCode,
        payload: &[u8],
    ) -> Result<IndexEntry, PersistError> {
        let size = payload.len() as u64;

        // Reserve the destination range under the lock; write outside it.
        let entry = {
            let mut inner = self.inner.lock();

            if inner.live_disk_bytes() + size > self.disk_capacity {
                self.reclaim_cold_locked(&mut inner, size)?;
            }

            if inner.current_offset > 0 && inner.current_offset + size > self.shard_capacity {
                inner.current_shard += 1;
                inner.current_offset = 0;
            }
            let entry = IndexEntry {
                hash,
                shard_id: inner.current_shard,
                payload_offset: inner.current_offset,
                payload_size: payload.len() as u32,
                width,
                height,
                stride_pixels: width,
                pixel_format: canonical_wire_format(),
                canonical_hash: actual_hash,
                payload_check: payload_check(payload),
                quality,
                flags: 0,
            };
            inner.current_offset += size;

            if let Some(old) = inner.index.insert(hash, entry.clone()) {
                if let Some(bytes) = inner.shard_sizes.get_mut(&old.shard_id) {
                    *bytes = bytes.saturating_sub(old.payload_size as u64);
                }
            }
            *inner.shard_sizes.entry(entry.shard_id).or_default() += size;
            inner.dirty = true;
            inner.index_seq += 1;
            entry
        };

        if let Err(err) = self.write_payload_at(&entry, payload) {
            tracing::warn!("payload append failed, queued for retry: {}", err);
            let mut inner = self.inner.lock();
            inner
                .retry_writes
                .insert(hash, (entry.clone(), payload.to_vec()));
        }

        Ok(entry)
    }

    fn write_payload_at(&self, entry: &IndexEntry, payload: &[u8]) -> Result<(), PersistError> {
        let path = self.dir.join(shard_file_name(entry.shard_id));
        let mut file = OpenOptions::new().create(true).write(true).open(&path)?;
        file.seek(SeekFrom::Start(entry.payload_offset))?;
        file.write_all(payload)?;
        Ok(())
    }

    /// Drop cold entries until `needed` additional bytes fit the budget.
    fn reclaim_cold_locked(
        &self,
        inner: &mut StoreInner,
        needed: u64,
    ) -> Result<(), PersistError> {
        while inner.live_disk_bytes() + needed > self.disk_capacity {
            let Some(victim) = inner.cold_lru.pop_back() else {
                return Err(PersistError::DiskFull);
            };
            if let Some(old) = inner.index.remove(&victim) {
                if let Some(bytes) = inner.shard_sizes.get_mut(&old.shard_id) {
                    *bytes = bytes.saturating_sub(old.payload_size as u64);
                }
                inner.note_evicted(victim);
                inner.dirty = true;
                inner.index_seq += 1;
            }
        }
        Ok(())
    }

    /// Retry failed payload appends, sync the current shard, and save the
    /// index if it has unsaved mutations. Payloads are flushed before the
    /// index so a crash strands at worst unreferenced bytes.
    pub fn flush_dirty(&self) -> Result<(), PersistError> {
        let retries: Vec<([u8; 16], (IndexEntry, Vec<u8>))> = {
            let mut inner = self.inner.lock();
            inner.retry_writes.drain().collect()
        };
        for (hash, (entry, payload)) in retries {
            if let Err(err) = self.write_payload_at(&entry, &payload) {
                tracing::warn!("payload retry failed: {}", err);
                let mut inner = self.inner.lock();
                inner.retry_writes.insert(hash, (entry, payload));
            }
        }

        let (dirty, current_shard) = {
            let inner = self.inner.lock();
            (inner.dirty, inner.current_shard)
        };
        let shard_path = self.dir.join(shard_file_name(current_shard));
        if shard_path.exists() {
            File::open(&shard_path)?.sync_all()?;
        }

        if dirty {
            self.save_index()?;
        }
        Ok(())
    }

    /// Atomically replace the on-disk index with the in-memory state.
    pub fn save_index(&self) -> Result<(), PersistError> {
        let entries: Vec<IndexEntry> = {
            let inner = self.inner.lock();
            inner.index.values().cloned().collect()
        };
        index::write_index(&self.dir.join(INDEX_FILE_NAME), &entries)?;
        self.inner.lock().dirty = false;
        Ok(())
    }

    /// Rewrite shards to squeeze out holes left by replaced or reclaimed
    /// entries. Returns bytes reclaimed.
    pub fn garbage_collect(&self) -> Result<u64, PersistError> {
        let shard_ids: Vec<u32> = {
            let inner = self.inner.lock();
            inner.shard_sizes.keys().copied().collect()
        };

        let mut reclaimed = 0u64;
        for shard_id in shard_ids {
            let path = self.dir.join(shard_file_name(shard_id));
            let file_len = match fs::metadata(&path) {
                Ok(m) => m.len(),
                Err(_) => continue,
            };
            let live: u64 = {
                let inner = self.inner.lock();
                inner.shard_sizes.get(&shard_id).copied().unwrap_or(0)
            };
            if live >= file_len {
                continue;
            }

            // Copy live payloads into a compacted replacement file.
            let mut entries: Vec<IndexEntry> = {
                let inner = self.inner.lock();
                inner
                    .index
                    .values()
                    .filter(|e| e.shard_id == shard_id)
                    .cloned()
                    .collect()
            };
            entries.sort_by_key(|e| e.payload_offset);

            let tmp_path = path.with_extension("dat.gc");
            let mut new_offsets = Vec::with_capacity(entries.len());
            {
                let mut out = File::create(&tmp_path)?;
                let mut offset = 0u64;
                for entry in &entries {
                    let payload = self.read_payload(entry)?;
                    out.write_all(&payload)?;
                    new_offsets.push(offset);
                    offset += payload.len() as u64;
                }
                out.sync_all()?;
            }
            fs::rename(&tmp_path, &path)?;

            let mut inner = self.inner.lock();
            for (entry, new_offset) in entries.iter().zip(new_offsets) {
                if let Some(live_entry) = inner.index.get_mut(&entry.hash) {
                    live_entry.payload_offset = new_offset;
                }
            }
            if inner.current_shard == shard_id {
                inner.current_offset = live;
            }
            inner.dirty = true;
            inner.index_seq += 1;
            reclaimed += file_len - live;
        }
        Ok(reclaimed)
    }

    /// Full index snapshot for the coordinator WELCOME message.
    pub fn snapshot(&self) -> (u32, u64, Vec<IndexEntry>) {
        let inner = self.inner.lock();
        (
            inner.current_shard,
            inner.index_seq,
            inner.index.values().cloned().collect(),
        )
    }

    /// Current index mutation sequence number.
    pub fn index_seq(&self) -> u64 {
        self.inner.lock().index_seq
    }

    /// Look up one index entry without touching the hot tier.
    pub fn index_entry(&self, hash: &[u8; 16]) -> Option<IndexEntry> {
        self.inner.lock().index.get(hash).cloned()
    }

    /// Apply index entries announced by the coordinator master. The caller
    /// provides the master's sequence number; a gap against the locally
    /// tracked one returns `false`, signalling that a full snapshot is
    /// needed.
    pub fn apply_index_update(&self, seq: u64, entries: Vec<IndexEntry>, expect_gapless: bool) -> bool {
        let mut inner = self.inner.lock();
        if expect_gapless && seq != inner.index_seq + entries.len() as u64 {
            tracing::warn!(
                "index update gap: local seq {}, master seq {}",
                inner.index_seq,
                seq
            );
            return false;
        }
        for entry in entries {
            if entry.shard_id > inner.current_shard {
                inner.current_shard = entry.shard_id;
                inner.current_offset = 0;
            }
            if entry.shard_id == inner.current_shard {
                inner.current_offset = inner
                    .current_offset
                    .max(entry.payload_offset + entry.payload_size as u64);
            }
            *inner.shard_sizes.entry(entry.shard_id).or_default() +=
                entry.payload_size as u64;
            if !inner.hot.contains(&entry.hash) && !inner.cold_lru.contains(&entry.hash) {
                inner.cold_lru.push_front(entry.hash);
            }
            if let Some(old) = inner.index.insert(entry.hash, entry) {
                // Re-announced entry (e.g. the ack'd write coming back via
                // broadcast): don't double-count its bytes.
                if let Some(bytes) = inner.shard_sizes.get_mut(&old.shard_id) {
                    *bytes = bytes.saturating_sub(old.payload_size as u64);
                }
            }
        }
        inner.index_seq = seq;
        true
    }

    /// Replace the whole index from a master snapshot.
    pub fn apply_snapshot(&self, current_shard: u32, seq: u64, entries: Vec<IndexEntry>) {
        let mut inner = self.inner.lock();
        inner.index.clear();
        inner.shard_sizes.clear();
        inner.cold_lru.clear();
        inner.current_shard = current_shard;
        inner.current_offset = 0;
        for entry in entries {
            if entry.shard_id == current_shard {
                inner.current_offset = inner
                    .current_offset
                    .max(entry.payload_offset + entry.payload_size as u64);
            }
            *inner.shard_sizes.entry(entry.shard_id).or_default() +=
                entry.payload_size as u64;
            if !inner.hot.contains(&entry.hash) {
                inner.cold_lru.push_back(entry.hash);
            }
            inner.index.insert(entry.hash, entry);
        }
        inner.index_seq = seq;
    }

    /// Insert into the hot tier only; disk persistence is the caller's
    /// concern (directly below, or routed through the coordinator).
    pub fn insert_memory(&self, hash: [u8; 16], entry: TierEntry) {
        let bytes = entry.pixels.len();
        let mut inner = self.inner.lock();
        inner.forget_cold(&hash);
        match inner.hot.insert(hash, entry, bytes) {
            Ok(evicted) => inner.absorb_hot_evictions(evicted),
            Err(err) => {
                tracing::debug!("entry too large for hot tier: {}", err);
            }
        }
    }

    /// Whether a payload of this quality would be written to disk: unknown
    /// hashes always, known hashes only on a quality upgrade (lossless
    /// replaces lossy; downgrades and same-quality re-sends are ignored).
    pub fn should_persist(&self, hash: &[u8; 16], quality: QualityCode) -> bool {
        match self.inner.lock().index.get(hash) {
            Some(existing) => quality > existing.quality,
            None => true,
        }
    }

    fn insert_inner(&self, hash: [u8; 16], entry: TierEntry, persistable: bool) {
        let should_append = persistable && self.should_persist(&hash, entry.quality);
        let (width, height, actual_hash, quality) =
            (entry.width, entry.height, entry.actual_hash, entry.quality);
        let payload = if should_append {
            Some(entry.pixels.clone())
        } else {
            None
        };
        self.insert_memory(hash, entry);

        if let Some(payload) = payload {
            if let Err(err) =
                self.append_payload(hash, width, height, actual_hash, quality, &payload)
            {
                tracing::warn!("entry stays memory-only: {}", err);
            }
        }
    }
}

impl PersistentTier for PersistentStore {
    fn lookup(&self, hash: &[u8; 16], width: u16, height: u16) -> Option<TierEntry> {
        {
            let mut inner = self.inner.lock();
            if let Some(entry) = inner.hot.get(hash) {
                if entry.width == width && entry.height == height {
                    return Some(entry.clone());
                }
                return None;
            }
            match inner.index.get(hash) {
                Some(entry) if entry.width == width && entry.height == height => {}
                _ => return None,
            }
        }
        // Cold hit: hydrate outside the table lock.
        self.hydrate(hash).ok()
    }

    fn insert(&self, hash: [u8; 16], entry: TierEntry, persistable: bool) {
        self.insert_inner(hash, entry, persistable);
    }

    fn contains(&self, hash: &[u8; 16]) -> bool {
        let inner = self.inner.lock();
        inner.hot.contains(hash) || inner.index.contains_key(hash)
    }

    fn take_evicted(&self) -> Vec<[u8; 16]> {
        std::mem::take(&mut self.inner.lock().pending_evictions)
    }

    fn inventory(&self) -> Vec<[u8; 16]> {
        let inner = self.inner.lock();
        let mut hashes: Vec<[u8; 16]> = inner.index.keys().copied().collect();
        for hash in inner.hot.resident_keys() {
            if !inner.index.contains_key(hash) {
                hashes.push(*hash);
            }
        }
        hashes
    }
}

impl Drop for PersistentStore {
    fn drop(&mut self) {
        // Under a coordinator, disk shutdown belongs to the elected master
        // (see CacheCoordinator::shutdown); a slave writing here would race
        // it.
        if self.coordinated {
            return;
        }
        if let Err(err) = self.flush_dirty() {
            tracing::warn!("flush on shutdown failed: {}", err);
        }
        if let Err(err) = self.save_index() {
            tracing::warn!("index save on shutdown failed: {}", err);
        }
        if let Err(err) = self.cleanup_orphan_shards() {
            tracing::warn!("orphan cleanup on shutdown failed: {}", err);
        }
    }
}
