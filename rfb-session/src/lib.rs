//! Cache-aware session glue: update emission on the server, update
//! consumption on the viewer, and the control-message dispatch between
//! them.
//!
//! The engines in `rfb-cache` expose intent (decisions, queued inits,
//! pending evictions); this crate turns that intent into bytes on an RFB
//! channel and back, enforcing the per-cycle ordering guarantees:
//!
//! - inits queued during cycle N are written at the start of cycle N+1,
//!   before any reference that may depend on them;
//! - an id is promoted to "known" only after the update carrying its init
//!   has been flushed;
//! - viewer eviction notifications are flushed after a frame is fully
//!   processed and before the next one is read.

pub mod error;
pub use error::SessionError;

pub mod payload;

pub mod server;
pub use server::ServerSession;

pub mod viewer;
pub use viewer::ViewerSession;
