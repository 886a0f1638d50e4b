//! Free-page tracking and the allocation-manager side of the commit
//! protocol.
//!
//! The allocatable set is held in memory as coalesced extents. At commit
//! time the set is serialized into a chain of free-list pages on the device,
//! rooted in the header's allocation region. Pages freed since the last
//! commit sit in a pending set: they are persisted as free (the commit being
//! written no longer references them) but are not handed out again until the
//! commit is durable, since the previous header may still reference them.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::convert::TryInto;
use std::ops::Range;

use crate::primitives::io::PageDevice;
use crate::types::checksum::chain_crc32;
use crate::types::{page, PageId, Result, StoreError};

use super::store::StoreStats;

/// A contiguous run of free pages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Extent {
    /// First page of the run.
    pub start: PageId,
    /// Number of pages in the run.
    pub len: u32,
}

impl Extent {
    /// Creates an extent covering `len` pages from `start`.
    pub fn new(start: PageId, len: u32) -> Self {
        Self { start, len }
    }

    /// Absorbs `other` if it starts exactly where this extent ends.
    pub fn coalesce_with(&mut self, other: &Extent) -> bool {
        if self.start.0 + self.len as u64 == other.start.0 {
            self.len += other.len;
            true
        } else {
            false
        }
    }

    /// First page id past the end of the run.
    pub fn end(&self) -> u64 {
        self.start.0 + self.len as u64
    }

    /// Iterates the page ids covered by the run.
    pub fn iter_pages(&self) -> impl Iterator<Item = PageId> + '_ {
        (0..self.len).map(move |off| PageId(self.start.0 + off as u64))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct HeapExtent {
    start: PageId,
    len: u32,
}

impl Ord for HeapExtent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.len
            .cmp(&other.len)
            .then_with(|| other.start.0.cmp(&self.start.0))
    }
}

impl PartialOrd for HeapExtent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<HeapExtent> for Extent {
    fn from(extent: HeapExtent) -> Self {
        Extent::new(extent.start, extent.len)
    }
}

impl From<Extent> for HeapExtent {
    fn from(extent: Extent) -> Self {
        HeapExtent {
            start: extent.start,
            len: extent.len,
        }
    }
}

/// Coalescing cache of free extents, popping from the largest run first.
#[derive(Clone, Default, Debug)]
pub struct FreeCache {
    extents: Vec<Extent>,
    heap: BinaryHeap<HeapExtent>,
}

impl FreeCache {
    /// Builds a cache from raw extents, merging adjacent runs.
    pub fn from_extents(extents: Vec<Extent>) -> Self {
        let mut cache = Self {
            extents,
            heap: BinaryHeap::new(),
        };
        cache.rebuild();
        cache
    }

    /// The current extents, sorted by start page.
    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Total number of free pages covered.
    pub fn page_count(&self) -> u64 {
        self.extents.iter().map(|e| e.len as u64).sum()
    }

    /// Removes and returns one free page, preferring the largest run.
    pub fn pop(&mut self) -> Option<PageId> {
        let mut extent = self.heap.pop()?;
        let page = extent.start;
        if let Ok(pos) = self
            .extents
            .binary_search_by_key(&extent.start.0, |e| e.start.0)
        {
            if extent.len > 1 {
                self.extents[pos].start.0 += 1;
                self.extents[pos].len -= 1;
                extent.start.0 += 1;
                extent.len -= 1;
                self.heap.push(extent);
            } else {
                self.extents.remove(pos);
            }
        } else {
            self.heap.push(extent);
            self.rebuild();
            return self.pop();
        }
        Some(page)
    }

    /// Adds extents to the cache and re-coalesces.
    pub fn extend(&mut self, mut extents: Vec<Extent>) {
        if extents.is_empty() {
            return;
        }
        self.extents.append(&mut extents);
        self.rebuild();
    }

    fn rebuild(&mut self) {
        if self.extents.is_empty() {
            self.heap.clear();
            return;
        }
        self.extents.sort_by(|a, b| a.start.0.cmp(&b.start.0));
        let mut merged: Vec<Extent> = Vec::with_capacity(self.extents.len());
        for extent in self.extents.drain(..) {
            if let Some(last) = merged.last_mut() {
                if last.coalesce_with(&extent) {
                    continue;
                }
            }
            merged.push(extent);
        }
        self.heap = BinaryHeap::from(
            merged
                .iter()
                .copied()
                .map(HeapExtent::from)
                .collect::<Vec<_>>(),
        );
        self.extents = merged;
    }
}

fn pages_to_extents(pages: &[PageId]) -> Vec<Extent> {
    let mut extents: Vec<Extent> = Vec::new();
    for &page in pages {
        if let Some(last) = extents.last_mut() {
            if last.end() == page.0 {
                last.len += 1;
                continue;
            }
        }
        extents.push(Extent::new(page, 1));
    }
    extents
}

// Chain page layout: next pointer, extent count, crc, then 16-byte extents.
const CHAIN_NEXT: Range<usize> = 0..8;
const CHAIN_COUNT: Range<usize> = 8..12;
const CHAIN_CRC: Range<usize> = 12..16;
const CHAIN_EXTENTS: usize = 16;
const CHAIN_EXTENT_LEN: usize = 16;

/// Number of extents one free-list chain page can hold.
pub fn chain_page_capacity(page_size: usize) -> usize {
    page_size.saturating_sub(CHAIN_EXTENTS) / CHAIN_EXTENT_LEN
}

struct ChainPage {
    next: PageId,
    extents: Vec<Extent>,
}

fn read_chain_page(buf: &[u8], page_size: usize, id: PageId) -> Result<ChainPage> {
    if buf.len() < page_size {
        return Err(StoreError::Corruption("free-list page truncated"));
    }
    let stored_crc = u32::from_be_bytes(buf[CHAIN_CRC].try_into().unwrap());
    let mut scratch = buf[..page_size].to_vec();
    scratch[CHAIN_CRC].fill(0);
    if chain_crc32(id.0, &scratch) != stored_crc {
        return Err(StoreError::Corruption("free-list page checksum mismatch"));
    }
    let next = PageId(u64::from_be_bytes(buf[CHAIN_NEXT].try_into().unwrap()));
    let count = u32::from_be_bytes(buf[CHAIN_COUNT].try_into().unwrap()) as usize;
    if count > chain_page_capacity(page_size) {
        return Err(StoreError::Corruption("free-list page count exceeds capacity"));
    }
    let mut extents = Vec::with_capacity(count);
    for i in 0..count {
        let off = CHAIN_EXTENTS + i * CHAIN_EXTENT_LEN;
        let start = PageId(u64::from_be_bytes(buf[off..off + 8].try_into().unwrap()));
        let len = u32::from_be_bytes(buf[off + 8..off + 12].try_into().unwrap());
        if buf[off + 12..off + 16] != [0; 4] {
            return Err(StoreError::Corruption("free-list extent reserved non-zero"));
        }
        if len == 0 {
            return Err(StoreError::Corruption("free-list extent is empty"));
        }
        extents.push(Extent::new(start, len));
    }
    Ok(ChainPage { next, extents })
}

fn write_chain_page(buf: &mut [u8], id: PageId, next: PageId, extents: &[Extent]) -> Result<()> {
    let page_size = buf.len();
    if extents.len() > chain_page_capacity(page_size) {
        return Err(StoreError::Invalid("too many extents for free-list page"));
    }
    buf.fill(0);
    buf[CHAIN_NEXT].copy_from_slice(&next.0.to_be_bytes());
    buf[CHAIN_COUNT].copy_from_slice(&(extents.len() as u32).to_be_bytes());
    for (idx, extent) in extents.iter().enumerate() {
        let off = CHAIN_EXTENTS + idx * CHAIN_EXTENT_LEN;
        buf[off..off + 8].copy_from_slice(&extent.start.0.to_be_bytes());
        buf[off + 8..off + 12].copy_from_slice(&extent.len.to_be_bytes());
    }
    let crc = chain_crc32(id.0, buf);
    buf[CHAIN_CRC].copy_from_slice(&crc.to_be_bytes());
    Ok(())
}

// Allocation region layout, relative to the region handed over by the store.
const REGION_TOTAL: Range<usize> = 0..8;
const REGION_FREE_HEAD: Range<usize> = 8..16;
const REGION_FREE_COUNT: Range<usize> = 16..24;
const REGION_LEN: usize = 24;

/// Tracks free and in-use pages and persists the free set at commit time.
///
/// The two-phase commit handshake: [`FreeList::commit_start`] serializes the
/// post-commit free set (including pages freed during the current interval)
/// and [`FreeList::commit_end`] publishes those pages for reuse once the
/// header is durable.
#[derive(Debug)]
pub struct FreeList {
    page_size: u32,
    total_pages: u64,
    free: FreeCache,
    pending: Vec<PageId>,
    chain_pages: Vec<PageId>,
}

impl FreeList {
    /// Creates the manager for a freshly initialized device: only the two
    /// header pages exist and nothing is free.
    pub fn new_empty(page_size: u32) -> Self {
        Self {
            page_size,
            total_pages: page::RESERVED_HEADER_PAGES,
            free: FreeCache::default(),
            pending: Vec::new(),
            chain_pages: Vec::new(),
        }
    }

    /// Reconstructs the manager from a recovered header region, walking the
    /// free-list chain on the device.
    pub fn load(region: &[u8], page_size: u32, dev: &dyn PageDevice) -> Result<Self> {
        let total_pages = Self::read_total_page_count(region)?;
        if total_pages < page::RESERVED_HEADER_PAGES {
            return Err(StoreError::Corruption("total page count below header pages"));
        }
        let free_head = PageId(u64::from_be_bytes(
            region[REGION_FREE_HEAD].try_into().unwrap(),
        ));
        let free_count = u64::from_be_bytes(region[REGION_FREE_COUNT].try_into().unwrap());

        let mut extents = Vec::new();
        let mut chain_pages = Vec::new();
        let mut next = free_head;
        let mut buf = vec![0u8; page_size as usize];
        while next.0 != 0 {
            if page::is_reserved(next) || next.0 >= total_pages {
                return Err(StoreError::Corruption("free-list chain page out of bounds"));
            }
            if chain_pages.len() as u64 >= total_pages {
                return Err(StoreError::Corruption("free-list chain does not terminate"));
            }
            dev.read_page(next, &mut buf)?;
            let chain = read_chain_page(&buf, page_size as usize, next)?;
            for extent in &chain.extents {
                if extent.start.0 < page::RESERVED_HEADER_PAGES || extent.end() > total_pages {
                    return Err(StoreError::Corruption("free extent out of bounds"));
                }
            }
            extents.extend(chain.extents);
            chain_pages.push(next);
            next = chain.next;
        }
        let free = FreeCache::from_extents(extents);
        if free.page_count() != free_count {
            return Err(StoreError::Corruption("free page count mismatch"));
        }
        Ok(Self {
            page_size,
            total_pages,
            free,
            pending: Vec::new(),
            chain_pages,
        })
    }

    /// Reads the total page count out of a header's allocation region.
    pub fn read_total_page_count(region: &[u8]) -> Result<u64> {
        if region.len() < REGION_LEN {
            return Err(StoreError::Corruption("allocation region truncated"));
        }
        Ok(u64::from_be_bytes(region[REGION_TOTAL].try_into().unwrap()))
    }

    /// Allocates a page, growing the logical page count when no free page
    /// exists. Never returns a reserved header page.
    pub fn alloc_page(&mut self) -> PageId {
        if let Some(id) = self.free.pop() {
            return id;
        }
        let id = PageId(self.total_pages);
        self.total_pages += 1;
        id
    }

    /// Allocates a page only if one is free; never grows the device.
    pub fn try_alloc_page(&mut self) -> Option<PageId> {
        self.free.pop()
    }

    /// Marks a page as deleted. It becomes allocatable again after the next
    /// commit completes.
    pub fn delete_page(&mut self, id: PageId) {
        self.pending.push(id);
    }

    /// Total logical page count, header pages included.
    pub fn alloc_page_count(&self) -> u64 {
        self.total_pages
    }

    /// Eagerly extends the device so `additional` pages beyond the current
    /// logical total physically exist. With `additional == 0` this forces
    /// any lazy extension to happen now.
    pub fn allocate_pages(&self, dev: &dyn PageDevice, additional: u64) -> Result<()> {
        let target = self
            .total_pages
            .checked_add(additional)
            .ok_or(StoreError::Invalid("page count overflow"))?;
        if dev.page_count()? < target {
            dev.set_page_count(target)?;
        }
        Ok(())
    }

    /// Folds this manager's counters into `stats`.
    pub fn add_to(&self, stats: &mut StoreStats) {
        stats.total_pages += self.total_pages;
        stats.free_pages += self.free.page_count() + self.pending.len() as u64;
    }

    /// Serializes the post-commit free set into `region` and the chain pages
    /// it references on `dev`.
    ///
    /// Chain pages are drawn from the currently-allocatable set only; pages
    /// freed during this commit interval may still be referenced by the
    /// previous durable header and must not be overwritten yet.
    pub fn commit_start(&mut self, region: &mut [u8], dev: &dyn PageDevice) -> Result<()> {
        if region.len() < REGION_LEN {
            return Err(StoreError::Invalid("allocation region too small"));
        }
        let capacity = chain_page_capacity(self.page_size as usize);
        if capacity == 0 {
            return Err(StoreError::Invalid("page size too small for free-list chain"));
        }

        let mut pending = std::mem::take(&mut self.pending);
        pending.append(&mut self.chain_pages);
        pending.sort_by_key(|p| p.0);
        pending.dedup();

        let mut chain: Vec<PageId> = Vec::new();
        loop {
            let mut persisted: Vec<PageId> = self
                .free
                .extents()
                .iter()
                .flat_map(|e| e.iter_pages())
                .collect();
            persisted.extend(pending.iter().copied());
            persisted.sort_by_key(|p| p.0);
            persisted.dedup();
            let extents = pages_to_extents(&persisted);
            let needed = extents.len().div_ceil(capacity);
            if chain.len() >= needed {
                let mut iter = extents.into_iter();
                let mut buf = vec![0u8; self.page_size as usize];
                for (idx, id) in chain.iter().enumerate() {
                    let slot: Vec<Extent> = iter.by_ref().take(capacity).collect();
                    let next = chain.get(idx + 1).copied().unwrap_or(PageId(0));
                    write_chain_page(&mut buf, *id, next, &slot)?;
                    dev.write_page(*id, &buf)?;
                }
                let free_head = chain.first().copied().unwrap_or(PageId(0));
                region.fill(0);
                region[REGION_TOTAL].copy_from_slice(&self.total_pages.to_be_bytes());
                region[REGION_FREE_HEAD].copy_from_slice(&free_head.0.to_be_bytes());
                region[REGION_FREE_COUNT]
                    .copy_from_slice(&(persisted.len() as u64).to_be_bytes());
                self.pending = pending;
                self.chain_pages = chain;
                return Ok(());
            }
            let id = match self.free.pop() {
                Some(id) => id,
                None => {
                    let id = PageId(self.total_pages);
                    self.total_pages += 1;
                    id
                }
            };
            chain.push(id);
        }
    }

    /// Publishes pages freed during the commit interval for reuse. Called
    /// only after the header referencing the new free set is durable.
    pub fn commit_end(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let mut pages = std::mem::take(&mut self.pending);
        pages.sort_by_key(|p| p.0);
        pages.dedup();
        pages.retain(|p| !self.chain_pages.contains(p));
        self.free.extend(pages_to_extents(&pages));
    }

    /// Marks every page below the logical total as in use.
    pub fn mark_all_pages(&self, usage: &mut PageUsage) {
        for id in 0..self.total_pages {
            usage.mark(PageId(id));
        }
    }

    /// Clears the marks for every page this manager considers free: the
    /// allocatable set, pending deletions, and the chain pages themselves.
    pub fn trace_free_pages(&self, usage: &mut PageUsage) {
        for extent in self.free.extents() {
            for id in extent.iter_pages() {
                usage.clear(id);
            }
        }
        for &id in &self.pending {
            usage.clear(id);
        }
        for &id in &self.chain_pages {
            usage.clear(id);
        }
    }
}

/// Page-usage bitmap for leak diagnostics.
#[derive(Clone, Debug)]
pub struct PageUsage {
    used: Vec<bool>,
}

impl PageUsage {
    /// Creates an all-clear bitmap covering `total_pages` pages.
    pub fn new(total_pages: u64) -> Self {
        Self {
            used: vec![false; total_pages as usize],
        }
    }

    /// Marks a page as in use.
    pub fn mark(&mut self, id: PageId) {
        if let Some(slot) = self.used.get_mut(id.0 as usize) {
            *slot = true;
        }
    }

    /// Clears a page's mark.
    pub fn clear(&mut self, id: PageId) {
        if let Some(slot) = self.used.get_mut(id.0 as usize) {
            *slot = false;
        }
    }

    /// Returns whether a page is marked.
    pub fn is_marked(&self, id: PageId) -> bool {
        self.used.get(id.0 as usize).copied().unwrap_or(false)
    }

    /// Number of marked pages.
    pub fn marked_count(&self) -> u64 {
        self.used.iter().filter(|&&b| b).count() as u64
    }
}
