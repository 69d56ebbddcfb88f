//! Wire protocol layer for the content-addressed rectangle cache.
//!
//! This crate provides the buffered big-endian streams the RFB channel is
//! read and written through, and byte-exact parsers/serializers for every
//! cache-related rectangle encoding and control message. Messages that are
//! part of the base RFB protocol (handshake, input events, ...) are outside
//! this crate's scope; the cache rides inside an established session.

pub mod io;
pub mod messages;

pub use io::{RfbInStream, RfbOutStream};
