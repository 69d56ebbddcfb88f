//! Cache protocol message types.
//!
//! - **Core types** ([`types`]) - PixelFormat, Rectangle, encoding constants
//! - **Rectangle encodings** ([`cache`]) - cache references and inits
//! - **Control messages** ([`control`]) - evictions, queries, data requests
//!
//! # Wire format rules
//!
//! 1. **Big-endian byte order** - all multi-byte integers use network byte order
//! 2. **Strict boolean validation** - boolean fields must be exactly 0 or 1
//! 3. **Padding validation** - padding bytes must be zero
//! 4. **Bounded counts** - counted arrays enforce hard limits on read and
//!    write; a violation is a protocol error that terminates the session

pub mod cache;
pub mod control;
pub mod types;

#[cfg(test)]
mod proptest_framing;
