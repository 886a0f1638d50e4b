//! Umbra page storage core.
//!
//! A fixed-size page store over a raw file: pages are allocated, written,
//! and deleted without mutating committed data in place, and a redundant
//! pair of checksummed headers makes every committed state recoverable
//! after a crash.

#![warn(missing_docs)]

pub mod primitives;
pub mod types;
