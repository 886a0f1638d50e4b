//! Streamed point-in-time snapshots of the store.
//!
//! A snapshot is a self-describing stream: a fixed header carrying the page
//! size and total page count as of the most recent commit, followed by the
//! raw page images in order. Restoring writes the pages to a fresh device
//! and reopens a store, which re-runs the normal recovery path.

use std::convert::TryInto;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::primitives::io::{FilePageDevice, PageDevice};
use crate::types::{page, PageId, Result, StoreError};

use super::store::PageStore;
use super::StoreOptions;

const SNAPSHOT_MAGIC: [u8; 8] = *b"UMBRSNAP";
const STREAM_HEADER_LEN: usize = 20;

/// Streams `total_pages` pages from `dev` to `out`, `cluster_pages` at a
/// time.
pub(super) fn stream(
    dev: &dyn PageDevice,
    page_size: u32,
    total_pages: u64,
    cluster_pages: usize,
    out: &mut dyn Write,
) -> Result<()> {
    let cluster = cluster_pages.max(1);
    let page_len = page_size as usize;

    let mut head = [0u8; STREAM_HEADER_LEN];
    head[0..8].copy_from_slice(&SNAPSHOT_MAGIC);
    head[8..12].copy_from_slice(&page_size.to_be_bytes());
    head[12..20].copy_from_slice(&total_pages.to_be_bytes());
    out.write_all(&head)?;

    let mut buf = vec![0u8; page_len * cluster];
    let mut next = 0u64;
    while next < total_pages {
        let batch = cluster.min((total_pages - next) as usize);
        for i in 0..batch {
            let off = i * page_len;
            dev.read_page(PageId(next + i as u64), &mut buf[off..off + page_len])?;
        }
        out.write_all(&buf[..batch * page_len])?;
        next += batch as u64;
    }
    out.flush()?;
    Ok(())
}

/// Rebuilds a device at `path` from a snapshot stream and reopens a store
/// against it. The page size is reconstructed from the stream itself.
pub fn restore_from_snapshot(input: &mut dyn Read, path: impl AsRef<Path>) -> Result<PageStore> {
    let mut head = [0u8; STREAM_HEADER_LEN];
    input.read_exact(&mut head)?;
    if head[0..8] != SNAPSHOT_MAGIC {
        return Err(StoreError::Corruption("bad snapshot magic"));
    }
    let page_size = u32::from_be_bytes(head[8..12].try_into().unwrap());
    if page_size < page::MIN_PAGE_SIZE || page_size % page::MIN_PAGE_SIZE != 0 {
        return Err(StoreError::Corruption("snapshot page size invalid"));
    }
    let total_pages = u64::from_be_bytes(head[12..20].try_into().unwrap());
    if total_pages < page::RESERVED_HEADER_PAGES {
        return Err(StoreError::Corruption("snapshot page count invalid"));
    }

    let dev = FilePageDevice::open(&path, page_size)?;
    dev.set_page_count(0)?;
    let mut buf = vec![0u8; page_size as usize];
    for id in 0..total_pages {
        input.read_exact(&mut buf)?;
        dev.write_page(PageId(id), &buf)?;
    }
    dev.set_page_count(total_pages)?;
    dev.sync(true)?;
    info!(page_size, total_pages, "store.snapshot.restored");
    PageStore::open(
        Arc::new(dev),
        StoreOptions {
            page_size,
            destroy: false,
        },
    )
}
