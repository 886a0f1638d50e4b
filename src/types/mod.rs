#![forbid(unsafe_code)]
//! Shared identifiers, error types, and on-disk constants.

use std::fmt;

pub mod checksum;

/// Identifier of a fixed-size page in the backing device.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors surfaced by the page store and its collaborators.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Failure from the underlying device.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// On-disk state failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller misuse of the API.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Open-time configuration mismatch.
    #[error("configuration: {0}")]
    Config(&'static str),
    /// The store has failed or been shut down; a new instance must be opened.
    #[error("store is closed")]
    Closed,
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, StoreError>;

pub mod page {
    //! Constants shared by the store's on-disk structures.

    use super::PageId;

    /// Magic identifying the store file format.
    pub const STORE_MAGIC: [u8; 8] = *b"UMBRSTOR";
    /// Default page size in bytes.
    pub const DEFAULT_PAGE_SIZE: u32 = 8192;
    /// Smallest supported page size; also the header slot length.
    pub const MIN_PAGE_SIZE: u32 = 512;
    /// Length of one header slot image. The slot is replicated across every
    /// `SLOT_LEN`-byte sub-block of a header page.
    pub const SLOT_LEN: usize = 512;
    /// Pages 0 and 1 hold the two header slots and are never allocatable.
    pub const RESERVED_HEADER_PAGES: u64 = 2;

    /// Returns true for the reserved header page ids.
    pub fn is_reserved(id: PageId) -> bool {
        id.0 < RESERVED_HEADER_PAGES
    }
}
