//! Content-addressed rectangle cache engines.
//!
//! Repeated pixel content in an RFB session is referenced by a small
//! identifier instead of being re-encoded and re-transmitted. One engine
//! core serves two policy faces:
//!
//! - **ContentCache**: session-scoped, server-assigned 64-bit ids.
//! - **PersistentCache**: cross-session, identified by a 16-byte canonical
//!   content hash and backed by disk on the viewer (see the `rfb-persist`
//!   crate).
//!
//! The server side ([`ServerCacheEngine`], [`EncoderPolicy`]) decides per
//! rectangle whether to encode normally, send a reference, or send an init
//! payload, under a strict synchronization discipline: an id is registered
//! as known only after its init has been written to the wire, and inits
//! discovered mid-cycle are queued to the next update cycle. The viewer
//! side ([`ViewerCacheEngine`]) stores decoded pixels, blits on references,
//! and reports evictions so the server never references dropped entries.

pub mod error;
pub use error::CacheError;

pub mod key;
pub use key::{CacheKey, PersistentKey, QualityCode};

pub mod entry;
pub use entry::CacheEntry;

pub mod hasher;
pub use hasher::{stream_hash, ContentHasher, NULL_HASH};

pub mod arc;
pub use arc::{ArcCache, ArcStats};

pub mod codec;
pub use codec::Codec;

pub mod stats;
pub use stats::{BandwidthStats, BaselineEstimator, DefaultEstimator};

pub mod config;
pub use config::{CacheConfig, HashConfig, PersistentCacheConfig};

pub mod server;
pub use server::{Decision, ServerCacheEngine};

pub mod viewer;
pub use viewer::{PersistentTier, TierEntry, ViewerCacheEngine};

pub mod policy;
pub use policy::{EncodeAction, EncoderPolicy};
