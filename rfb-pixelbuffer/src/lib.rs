//! Pixel formats and buffers for the RFB rectangle cache.
//!
//! This crate provides pixel format descriptions, the canonical pixel layout
//! used for content hashing and persistent storage, and the buffer traits the
//! cache engines read pixels through.

pub mod format;
pub use format::PixelFormat;

pub mod buffer;
pub use buffer::{MutablePixelBuffer, PixelBuffer};

pub mod managed;
pub use managed::ManagedPixelBuffer;
