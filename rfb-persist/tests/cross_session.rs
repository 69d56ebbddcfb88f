//! Cross-session persistence: content initialized in one session is
//! referenced by hash in the next, with no second init.

use rfb_cache::{
    CacheConfig, Codec, ContentHasher, EncodeAction, EncoderPolicy, PersistentCacheConfig,
    ServerCacheEngine, ViewerCacheEngine,
};
use rfb_common::Rect;
use rfb_persist::PersistentStore;
use rfb_pixelbuffer::{ManagedPixelBuffer, MutablePixelBuffer, PixelBuffer, PixelFormat};
use tempfile::TempDir;

fn server_engine() -> ServerCacheEngine {
    let mut engine = ServerCacheEngine::new(&CacheConfig {
        enabled: true,
        memory_mib: 64,
        min_rect_size_pixels: 4096,
        max_age_seconds: 0,
    });
    engine.set_capabilities(true, true);
    engine
}

fn viewer_with_store(dir: &TempDir) -> (ViewerCacheEngine, std::sync::Arc<PersistentStore>) {
    let store = PersistentStore::open(&PersistentCacheConfig {
        enabled: true,
        memory_mib: 16,
        disk_mib: Some(32),
        shard_mib: 4,
        directory: Some(dir.path().to_path_buf()),
        coordinate: false,
    })
    .unwrap();
    let engine = ViewerCacheEngine::new(
        &CacheConfig {
            enabled: true,
            memory_mib: 16,
            min_rect_size_pixels: 4096,
            max_age_seconds: 0,
        },
        ContentHasher::unsampled(),
    )
    .with_persistent_tier(Box::new(std::sync::Arc::clone(&store)));
    (engine, store)
}

#[test]
fn persistent_cross_session() {
    let cache_dir = TempDir::new().unwrap();
    let policy = EncoderPolicy::new(ContentHasher::unsampled());
    let codec = Codec::Raw;

    let mut server_fb = ManagedPixelBuffer::new(256, 256, PixelFormat::canonical());
    let pixel = PixelFormat::canonical().from_rgb888([0x30, 0x60, 0x90, 0xFF]);
    server_fb
        .fill_rect(Rect::new(0, 0, 256, 256), &pixel)
        .unwrap();
    let rect = Rect::new(0, 0, 64, 64);

    let canonical_bytes = server_fb.canonical_rect(rect).unwrap();
    let hash = ContentHasher::unsampled()
        .persistent_hash_canonical(&canonical_bytes, 64, 64)
        .unwrap();

    // --- Session 1 ---
    {
        let mut server = server_engine();
        let (mut viewer, store) = viewer_with_store(&cache_dir);
        let mut viewer_fb = ManagedPixelBuffer::new(256, 256, PixelFormat::canonical());

        // First sight queues a persistent seed for the next cycle.
        let action = policy.decide(&mut server, &server_fb, rect, &codec);
        assert_eq!(action, EncodeAction::Normal);
        let seeds = server.take_pending_persistent_inits();
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].0, hash);

        // Next cycle: the init reaches the viewer and lands on disk.
        let payload = codec.encode(&canonical_bytes, 64, 64).unwrap();
        viewer
            .on_persistent_rect_init(rect, hash, codec.encoding_id(), &payload, &mut viewer_fb)
            .unwrap();
        server.register_pending_hash(hash);
        server.confirm_pending();

        // Within the same session, repeats reference the hash.
        let action = policy.decide(&mut server, &server_fb, rect, &codec);
        assert_eq!(action, EncodeAction::SendPersistentRef { hash });

        store.flush_dirty().unwrap();
    } // session 1 ends; store drop saves the index

    // --- Session 2: viewer restarts, different server instance ---
    let mut server = server_engine();
    let (mut viewer, store) = viewer_with_store(&cache_dir);
    let mut viewer_fb = ManagedPixelBuffer::new(256, 256, PixelFormat::canonical());

    // The restarted viewer advertises its inventory; the server records it
    // as known.
    let chunks = viewer.inventory_chunks(100);
    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].contains(&hash));
    for chunk in &chunks {
        server.on_hash_list(chunk);
    }

    // First matching rectangle in session 2 is referenced immediately; no
    // init is ever queued for this hash.
    let action = policy.decide(&mut server, &server_fb, rect, &codec);
    assert_eq!(action, EncodeAction::SendPersistentRef { hash });
    assert!(server.take_pending_persistent_inits().is_empty());

    // The viewer blits from the disk-hydrated entry.
    let hit = viewer
        .on_persistent_rect_ref(rect, hash, &mut viewer_fb)
        .unwrap();
    assert!(hit);
    assert_eq!(viewer_fb.canonical_rect(rect).unwrap(), canonical_bytes);

    drop(store);
}

#[test]
fn evicted_hash_is_not_referenced_next_time() {
    let cache_dir = TempDir::new().unwrap();
    let policy = EncoderPolicy::new(ContentHasher::unsampled());
    let codec = Codec::Raw;

    let mut server = server_engine();
    let (mut viewer, store) = viewer_with_store(&cache_dir);
    let mut server_fb = ManagedPixelBuffer::new(128, 128, PixelFormat::canonical());
    let pixel = PixelFormat::canonical().from_rgb888([7, 7, 7, 0xFF]);
    server_fb
        .fill_rect(Rect::new(0, 0, 128, 128), &pixel)
        .unwrap();
    let mut viewer_fb = ManagedPixelBuffer::new(128, 128, PixelFormat::canonical());
    let rect = Rect::new(0, 0, 64, 64);

    // Establish the hash as known.
    policy.decide(&mut server, &server_fb, rect, &codec);
    let (hash, _) = server.take_pending_persistent_inits()[0];
    let canonical_bytes = server_fb.canonical_rect(rect).unwrap();
    let payload = codec.encode(&canonical_bytes, 64, 64).unwrap();
    viewer
        .on_persistent_rect_init(rect, hash, codec.encoding_id(), &payload, &mut viewer_fb)
        .unwrap();
    server.register_pending_hash(hash);
    server.confirm_pending();
    assert_eq!(
        policy.decide(&mut server, &server_fb, rect, &codec),
        EncodeAction::SendPersistentRef { hash }
    );

    // The viewer's tier drops the entry (capacity, corruption, whatever)
    // and the eviction notice reaches the server: no more references.
    let (_, persistent_evictions) = viewer.take_pending_evictions();
    // Nothing evicted yet in this small test; force the loss directly.
    assert!(persistent_evictions.is_empty());
    server.on_viewer_hash_eviction(&[hash]);

    let action = policy.decide(&mut server, &server_fb, rect, &codec);
    assert_eq!(action, EncodeAction::Normal);
    drop(store);
}
