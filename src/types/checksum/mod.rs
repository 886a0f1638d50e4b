#![forbid(unsafe_code)]
//! Checksum helpers for the store's on-disk structures.

/// Incremental checksum over byte slices.
pub trait Checksum {
    /// Resets the checksum to its initial state.
    fn reset(&mut self);
    /// Feeds bytes into the checksum.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed so far.
    fn finalize(&self) -> u32;
}

/// CRC-32 implementation backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// Checksum of a header slot image. Covers exactly the bytes given; the
/// caller zeroes the stored checksum field first.
pub fn slot_crc32(payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Checksum of a free-list chain page, bound to the page number so a
/// misdirected write cannot validate under another id.
pub fn chain_crc32(page_no: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page_no.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}
