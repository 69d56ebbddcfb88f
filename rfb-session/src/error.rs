//! Session-level errors.

use thiserror::Error;

/// Errors surfaced by the session layer.
///
/// Protocol violations abort the session; cache and codec failures are
/// recovered by the caller (the rectangle degrades to normal encoding or
/// is dropped) and exist here mainly for logging.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("cache error: {0}")]
    Cache(#[from] rfb_cache::CacheError),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}
