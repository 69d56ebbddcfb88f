//! Error types for the cache engines.

use thiserror::Error;

/// Errors produced by the cache core.
///
/// Most of these are recovered locally: a rectangle that cannot be cached is
/// simply encoded normally, and the session continues. Only protocol-level
/// violations (handled in `rfb-protocol`) tear a session down.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A single entry is larger than the whole cache.
    #[error("entry of {size} bytes exceeds cache capacity of {capacity} bytes")]
    EntryTooLarge { size: usize, capacity: usize },

    /// Stored entry geometry disagrees with the rectangle being processed.
    #[error("dimension mismatch: entry is {entry_width}x{entry_height}, rectangle is {rect_width}x{rect_height}")]
    DimensionMismatch {
        entry_width: u16,
        entry_height: u16,
        rect_width: u16,
        rect_height: u16,
    },

    /// Entry byte length does not match its recorded geometry.
    #[error("pixel payload is {actual} bytes, geometry requires {expected}")]
    PayloadLength { expected: usize, actual: usize },

    /// Inner codec failed to encode or decode.
    #[error("codec error: {0}")]
    Codec(#[from] anyhow::Error),

    /// The rectangle cannot be hashed (empty, out of bounds, bad format).
    #[error("rectangle is not hashable: {0}")]
    NotHashable(String),
}
