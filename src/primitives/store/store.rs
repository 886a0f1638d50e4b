//! The page store: orchestrates page I/O, owns the redundant header pair,
//! and drives the two-phase commit protocol.

use std::io::{ErrorKind, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::primitives::concurrency::{
    CommitLock, ExclusiveCommitGuard, Latch, SharedCommitGuard,
};
use crate::primitives::io::{FilePageDevice, PageDevice};
use crate::types::{page, PageId, Result, StoreError};

use super::freelist::FreeList;
use super::header::{self, SlotHeader};
use super::snapshot;
use super::StoreOptions;

/// Supplies up to 256 bytes of caller state to persist in the header at
/// commit time.
///
/// `prepare` is invoked synchronously inside `commit`, after the allocation
/// state has been serialized; it is expected to have already durably written
/// whatever pages its returned bytes refer to.
pub trait CommitCallback: Send + Sync {
    /// Flushes dependent state and returns the extra commit data.
    fn prepare(&self) -> Result<Vec<u8>>;
}

/// Point-in-time page counters, derived from the allocation manager.
#[derive(Default, Clone, Copy, Debug, Eq, PartialEq)]
pub struct StoreStats {
    /// Total logical pages, header pages included.
    pub total_pages: u64,
    /// Pages currently free or pending reuse.
    pub free_pages: u64,
}

struct HeaderState {
    commit_number: i32,
}

/// Crash-consistent fixed-size page store over a [`PageDevice`].
///
/// Pages 0 and 1 hold the two header slots; commits alternate between them
/// by commit-number parity, so the untouched slot always carries the
/// previous durable state. Any internal error permanently closes the
/// instance; a new one must be opened to resume work.
///
/// `read_page`/`write_page` take no lock: committed pages are immutable
/// until deleted, and callers must not read a page whose deletion races an
/// in-flight commit.
pub struct PageStore {
    dev: Arc<dyn PageDevice>,
    page_size: u32,
    commit_lock: CommitLock,
    header: Latch<HeaderState>,
    manager: Mutex<FreeList>,
    closed: AtomicBool,
}

impl std::fmt::Debug for PageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageStore")
            .field("page_size", &self.page_size)
            .field("closed", &self.closed.load(AtomicOrdering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl PageStore {
    /// Opens a store over `dev`, initializing fresh when `options.destroy`
    /// is set or the device is empty, and recovering from the header pair
    /// otherwise.
    pub fn open(dev: Arc<dyn PageDevice>, options: StoreOptions) -> Result<Self> {
        let page_size = options.page_size;
        if page_size < page::MIN_PAGE_SIZE || page_size % page::MIN_PAGE_SIZE != 0 {
            return Err(StoreError::Config("unsupported page size"));
        }
        if dev.page_size() != page_size {
            return Err(StoreError::Config("device page size mismatch"));
        }
        if options.destroy {
            dev.set_page_count(0)?;
        }
        if options.destroy || dev.is_empty()? {
            Self::initialize(dev, page_size)
        } else {
            Self::recover(dev, page_size)
        }
    }

    /// Opens the file at `path` as the backing device and then the store.
    pub fn open_path(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let dev = Arc::new(FilePageDevice::open(path, options.page_size)?);
        Self::open(dev, options)
    }

    fn initialize(dev: Arc<dyn PageDevice>, page_size: u32) -> Result<Self> {
        let store = Self {
            dev,
            page_size,
            commit_lock: CommitLock::new(),
            header: Latch::new(HeaderState { commit_number: -1 }),
            manager: Mutex::new(FreeList::new_empty(page_size)),
            closed: AtomicBool::new(false),
        };
        // Two back-to-back commits so both slots are valid with consecutive
        // commit numbers.
        store.commit(None)?;
        store.commit(None)?;
        store.dev.set_page_count(page::RESERVED_HEADER_PAGES)?;
        info!(page_size, "store.open.initialized");
        Ok(store)
    }

    fn recover(dev: Arc<dyn PageDevice>, page_size: u32) -> Result<Self> {
        let slot0 = Self::read_slot(dev.as_ref(), PageId(0))?;
        let slot1 = Self::read_slot(dev.as_ref(), PageId(1))?;
        let (winner, slot_buf) = match (slot0, slot1) {
            (None, None) => {
                return Err(StoreError::Corruption("both header slots are corrupt"));
            }
            (Some((h, buf)), None) | (None, Some((h, buf))) => {
                if h.page_size != page_size {
                    return Err(StoreError::Config(
                        "page size mismatch between caller and store",
                    ));
                }
                (h, buf)
            }
            (Some((h0, buf0)), Some((h1, buf1))) => {
                if h0.page_size != h1.page_size {
                    return Err(StoreError::Config("header page size disagreement"));
                }
                if h0.page_size != page_size {
                    return Err(StoreError::Config(
                        "page size mismatch between caller and store",
                    ));
                }
                let delta = h0.commit_number.wrapping_sub(h1.commit_number);
                if delta == 0 {
                    return Err(StoreError::Corruption(
                        "both header slots carry the same commit number",
                    ));
                }
                if delta > 0 {
                    (h0, buf0)
                } else {
                    (h1, buf1)
                }
            }
        };
        let manager = FreeList::load(&slot_buf[header::ALLOC_REGION], page_size, dev.as_ref())?;
        info!(
            commit_number = winner.commit_number,
            slot = header::slot_for(winner.commit_number).0,
            "store.open.recovered"
        );
        Ok(Self {
            dev,
            page_size,
            commit_lock: CommitLock::new(),
            header: Latch::new(HeaderState {
                commit_number: winner.commit_number,
            }),
            manager: Mutex::new(manager),
            closed: AtomicBool::new(false),
        })
    }

    /// Reads and validates one header slot. `Ok(None)` means the slot is
    /// corrupt or truncated; only genuine device failures propagate.
    fn read_slot(
        dev: &dyn PageDevice,
        id: PageId,
    ) -> Result<Option<(SlotHeader, [u8; page::SLOT_LEN])>> {
        let mut buf = [0u8; page::SLOT_LEN];
        match dev.read_partial(id, 0, &mut buf) {
            Ok(()) => {}
            Err(StoreError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                warn!(slot = id.0, "store.open.header_slot_truncated");
                return Ok(None);
            }
            Err(err) => return Err(err),
        }
        match header::decode_slot(&buf) {
            Ok(h) => Ok(Some((h, buf))),
            Err(StoreError::Corruption(reason)) => {
                warn!(slot = id.0, reason, "store.open.header_slot_corrupt");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Returns the page size in bytes.
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Commit number of the most recently durable commit.
    pub fn commit_number(&self) -> i32 {
        self.header.shared().commit_number
    }

    /// Returns total and free page counts as of now.
    pub fn stats(&self) -> Result<StoreStats> {
        self.ensure_open()?;
        let mut stats = StoreStats::default();
        self.manager.lock().add_to(&mut stats);
        Ok(stats)
    }

    /// Reads a full page. Uncommitted writes are visible immediately.
    pub fn read_page(&self, id: PageId, buf: &mut [u8]) -> Result<()> {
        if buf.len() != self.page_size as usize {
            return Err(StoreError::Invalid("read buffer is not one page long"));
        }
        self.ensure_open()?;
        let result = self.dev.read_page(id, buf);
        self.guard(result)
    }

    /// Reads `buf.len()` bytes starting at `offset` within the page.
    pub fn read_partial(&self, id: PageId, offset: u32, buf: &mut [u8]) -> Result<()> {
        if u64::from(offset) + buf.len() as u64 > u64::from(self.page_size) {
            return Err(StoreError::Invalid("partial read crosses page boundary"));
        }
        self.ensure_open()?;
        let result = self.dev.read_partial(id, offset, buf);
        self.guard(result)
    }

    /// Writes a full page. The write is visible to reads immediately but is
    /// only durable after the next commit.
    pub fn write_page(&self, id: PageId, buf: &[u8]) -> Result<()> {
        Self::check_unreserved(id)?;
        if buf.len() != self.page_size as usize {
            return Err(StoreError::Invalid("write buffer is not one page long"));
        }
        self.ensure_open()?;
        let result = self.dev.write_page(id, buf);
        self.guard(result)
    }

    /// Allocates a page, growing the logical page count when none is free.
    pub fn alloc_page(&self) -> Result<PageId> {
        self.ensure_open()?;
        let _lock = self.commit_lock.shared();
        let id = self.manager.lock().alloc_page();
        debug!(page = id.0, "store.alloc.page");
        Ok(id)
    }

    /// Allocates a page only if one is free, never growing the device.
    pub fn try_alloc_page(&self) -> Result<Option<PageId>> {
        self.ensure_open()?;
        let _lock = self.commit_lock.shared();
        Ok(self.manager.lock().try_alloc_page())
    }

    /// Total logical page count, header pages included.
    pub fn alloc_page_count(&self) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.manager.lock().alloc_page_count())
    }

    /// Deletes a page. The id becomes allocatable again only after the next
    /// commit. Deleting the same page twice between two commits is not
    /// detected and corrupts the free list.
    pub fn delete_page(&self, id: PageId) -> Result<()> {
        Self::check_unreserved(id)?;
        self.ensure_open()?;
        let _lock = self.commit_lock.shared();
        self.manager.lock().delete_page(id);
        debug!(page = id.0, "store.delete.page");
        Ok(())
    }

    /// Eagerly extends the device so `additional` pages beyond the logical
    /// total physically exist; `additional == 0` forces any lazy extension
    /// to happen now. Useful for pre-flighting disk-full conditions outside
    /// of a commit.
    pub fn allocate_pages(&self, additional: u64) -> Result<()> {
        self.ensure_open()?;
        let _lock = self.commit_lock.shared();
        let manager = self.manager.lock();
        let result = manager.allocate_pages(self.dev.as_ref(), additional);
        drop(manager);
        self.guard(result)
    }

    /// Acquires the commit lock in shared mode.
    pub fn shared_commit_lock(&self) -> SharedCommitGuard {
        self.commit_lock.shared()
    }

    /// Acquires the commit lock in exclusive mode.
    pub fn exclusive_commit_lock(&self) -> ExclusiveCommitGuard {
        self.commit_lock.exclusive()
    }

    /// Durably commits everything allocated, written, and deleted so far.
    ///
    /// The next commit number is minted under a transient exclusive hold of
    /// the commit lock, which is immediately downgraded so allocators keep
    /// running during the flush. Data pages are synced before the header
    /// that references them; the in-memory commit number only advances after
    /// the header flush succeeds.
    pub fn commit(&self, callback: Option<&dyn CommitCallback>) -> Result<()> {
        self.ensure_open()?;
        let result = self.commit_inner(callback);
        self.guard(result)
    }

    fn commit_inner(&self, callback: Option<&dyn CommitCallback>) -> Result<()> {
        let exclusive = self.commit_lock.exclusive();
        let next = self.header.shared().commit_number.wrapping_add(1);
        let _shared = CommitLock::downgrade(exclusive);
        debug!(commit_number = next, "store.commit.begin");

        let mut buf = vec![0u8; self.page_size as usize];
        self.manager
            .lock()
            .commit_start(&mut buf[header::ALLOC_REGION], self.dev.as_ref())?;

        if let Some(callback) = callback {
            let extra = callback.prepare()?;
            if extra.len() > header::EXTRA_DATA_LEN {
                return Err(StoreError::Invalid("extra commit data exceeds 256 bytes"));
            }
            buf[header::EXTRA_DATA.start..header::EXTRA_DATA.start + extra.len()]
                .copy_from_slice(&extra);
        }

        header::seal(&mut buf, self.page_size, next)?;
        self.dev.sync(false)?;

        let slot = header::slot_for(next);
        {
            let mut state = self.header.exclusive();
            self.dev.write_page(slot, &buf)?;
            self.dev.sync(true)?;
            state.commit_number = next;
        }
        self.manager.lock().commit_end();
        info!(commit_number = next, slot = slot.0, "store.commit.applied");
        Ok(())
    }

    /// Copies the current header's extra commit data into `buf`, up to 256
    /// bytes, zero-padded beyond what the last callback supplied.
    pub fn read_extra_commit_data(&self, buf: &mut [u8]) -> Result<()> {
        self.ensure_open()?;
        let result = (|| -> Result<()> {
            let state = self.header.shared();
            let slot = header::slot_for(state.commit_number);
            let mut extra = [0u8; header::EXTRA_DATA_LEN];
            self.dev
                .read_partial(slot, header::EXTRA_DATA.start as u32, &mut extra)?;
            let n = buf.len().min(extra.len());
            buf[..n].copy_from_slice(&extra[..n]);
            Ok(())
        })();
        self.guard(result)
    }

    /// Streams a point-in-time copy of all pages as of the most recent
    /// commit, `cluster_pages` pages at a time.
    ///
    /// The header latch is held only while the committed total page count is
    /// read; callers that require a perfectly frozen image must not commit
    /// while the stream is in progress.
    pub fn begin_snapshot(&self, out: &mut dyn Write, cluster_pages: usize) -> Result<()> {
        self.ensure_open()?;
        let result = (|| -> Result<()> {
            let total = {
                let state = self.header.shared();
                let slot = header::slot_for(state.commit_number);
                let mut buf = [0u8; page::SLOT_LEN];
                self.dev.read_partial(slot, 0, &mut buf)?;
                header::decode_slot(&buf)?;
                FreeList::read_total_page_count(&buf[header::ALLOC_REGION])?
            };
            info!(total_pages = total, "store.snapshot.begin");
            snapshot::stream(self.dev.as_ref(), self.page_size, total, cluster_pages, out)
        })();
        self.guard(result)
    }

    /// Closes the store. All subsequent operations fail with
    /// [`StoreError::Closed`]. Safe to call multiple times.
    pub fn close(&self) {
        if !self.closed.swap(true, AtomicOrdering::AcqRel) {
            debug!("store.close");
        }
    }

    /// Returns true once the store has been closed, explicitly or by an
    /// internal failure.
    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn check_unreserved(id: PageId) -> Result<()> {
        if page::is_reserved(id) {
            Err(StoreError::Invalid("page id is reserved for headers"))
        } else {
            Ok(())
        }
    }

    /// Fail-stop boundary: once an operation has touched device or manager
    /// state, any error closes the store before propagating.
    fn guard<T>(&self, result: Result<T>) -> Result<T> {
        result.map_err(|err| {
            warn!(error = %err, "store.close.on_failure");
            self.closed.store(true, AtomicOrdering::Release);
            err
        })
    }
}
