//! End-to-end exercises of the public store surface: allocation, commit,
//! reopen, and extra commit data.

use std::fs;

use tempfile::tempdir;
use umbra::primitives::store::{CommitCallback, PageStore, StoreOptions, StoreStats};
use umbra::types::{PageId, Result, StoreError};

const PAGE_SIZE: u32 = 512;

fn options() -> StoreOptions {
    StoreOptions {
        page_size: PAGE_SIZE,
        destroy: false,
    }
}

fn page_filled(tag: u8) -> Vec<u8> {
    let mut data = vec![tag; PAGE_SIZE as usize];
    data[0..4].copy_from_slice(b"PAGE");
    data
}

struct ExtraData(Vec<u8>);

impl CommitCallback for ExtraData {
    fn prepare(&self) -> Result<Vec<u8>> {
        Ok(self.0.clone())
    }
}

#[test]
fn end_to_end_commit_survives_reopen() -> Result<()> {
    let dir = tempdir().unwrap();
    let path = dir.path().join("e2e.db");

    let pages = {
        let store = PageStore::open_path(&path, options())?;
        let mut pages = Vec::new();
        for tag in 0..3u8 {
            let id = store.alloc_page()?;
            store.write_page(id, &page_filled(tag + 10))?;
            pages.push(id);
        }
        store.commit(None)?;
        // Dropping without close() simulates a killed process: recovery must
        // come entirely from the durable state.
        pages
    };

    let store = PageStore::open_path(&path, options())?;
    assert_eq!(
        store.stats()?,
        StoreStats {
            total_pages: 5,
            free_pages: 0
        },
        "2 header pages + 3 data pages, nothing free"
    );
    for (idx, &id) in pages.iter().enumerate() {
        let mut back = vec![0u8; PAGE_SIZE as usize];
        store.read_page(id, &mut back)?;
        assert_eq!(back, page_filled(idx as u8 + 10), "page {id} content");
    }
    Ok(())
}

#[test]
fn extra_commit_data_round_trips() -> Result<()> {
    let dir = tempdir().unwrap();
    let path = dir.path().join("extra.db");
    let payload = b"btree-root=17;txid=42".to_vec();

    {
        let store = PageStore::open_path(&path, options())?;
        let callback = ExtraData(payload.clone());
        store.commit(Some(&callback))?;

        let mut extra = [0u8; 256];
        store.read_extra_commit_data(&mut extra)?;
        assert_eq!(&extra[..payload.len()], payload.as_slice());
        assert!(
            extra[payload.len()..].iter().all(|&b| b == 0),
            "extra data is zero-padded past the supplied bytes"
        );
    }

    // Still readable after recovery.
    let store = PageStore::open_path(&path, options())?;
    let mut extra = [0u8; 256];
    store.read_extra_commit_data(&mut extra)?;
    assert_eq!(&extra[..payload.len()], payload.as_slice());
    Ok(())
}

#[test]
fn oversized_extra_data_is_rejected() -> Result<()> {
    let dir = tempdir().unwrap();
    let store = PageStore::open_path(dir.path().join("oversized.db"), options())?;
    let callback = ExtraData(vec![1u8; 257]);
    assert!(matches!(
        store.commit(Some(&callback)),
        Err(StoreError::Invalid(_))
    ));
    assert!(
        store.is_closed(),
        "a failure inside commit must close the store"
    );
    Ok(())
}

#[test]
fn commits_are_monotonic() -> Result<()> {
    let dir = tempdir().unwrap();
    let store = PageStore::open_path(dir.path().join("monotonic.db"), options())?;
    let before = store.commit_number();
    for i in 1..=5 {
        store.commit(None)?;
        assert_eq!(store.commit_number(), before + i);
    }
    Ok(())
}

#[test]
fn deleted_pages_are_reused_after_commit() -> Result<()> {
    let dir = tempdir().unwrap();
    let store = PageStore::open_path(dir.path().join("reuse.db"), options())?;
    let id = store.alloc_page()?;
    store.write_page(id, &page_filled(1))?;
    store.commit(None)?;

    store.delete_page(id)?;
    assert_eq!(
        store.try_alloc_page()?,
        None,
        "a page freed this interval is not reusable before the commit"
    );
    store.commit(None)?;
    assert_eq!(store.try_alloc_page()?, Some(id));
    Ok(())
}

#[test]
fn allocate_pages_extends_the_file_eagerly() -> Result<()> {
    let dir = tempdir().unwrap();
    let path = dir.path().join("preflight.db");
    let store = PageStore::open_path(&path, options())?;
    let total = store.alloc_page_count()?;

    store.allocate_pages(4)?;
    let len = fs::metadata(&path).unwrap().len();
    assert!(
        len >= (total + 4) * u64::from(PAGE_SIZE),
        "file should hold {} pages, has {} bytes",
        total + 4,
        len
    );

    // count == 0 still forces lazy extension of the logical total.
    let id = store.alloc_page()?;
    for _ in 0..8 {
        store.alloc_page()?;
    }
    store.allocate_pages(0)?;
    let len = fs::metadata(&path).unwrap().len();
    assert!(len >= store.alloc_page_count()? * u64::from(PAGE_SIZE));
    assert!(id.0 >= 2);
    Ok(())
}

#[test]
fn stats_track_allocation_and_delete() -> Result<()> {
    let dir = tempdir().unwrap();
    let store = PageStore::open_path(dir.path().join("stats.db"), options())?;
    let a = store.alloc_page()?;
    let _b = store.alloc_page()?;
    assert_eq!(
        store.stats()?,
        StoreStats {
            total_pages: 4,
            free_pages: 0
        }
    );
    store.delete_page(a)?;
    assert_eq!(store.stats()?.free_pages, 1);
    Ok(())
}

#[test]
fn commit_lock_accessors_expose_both_modes() -> Result<()> {
    let dir = tempdir().unwrap();
    let store = PageStore::open_path(dir.path().join("locks.db"), options())?;
    {
        let _shared_a = store.shared_commit_lock();
        let _shared_b = store.shared_commit_lock();
    }
    let _exclusive = store.exclusive_commit_lock();
    Ok(())
}

#[test]
fn concurrent_allocators_never_collide() -> Result<()> {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    let dir = tempdir().unwrap();
    let store = Arc::new(PageStore::open_path(dir.path().join("threads.db"), options())?);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || -> Result<Vec<PageId>> {
            let mut ids = Vec::new();
            for _ in 0..64 {
                ids.push(store.alloc_page()?);
            }
            Ok(ids)
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.join().unwrap()? {
            assert!(id.0 >= 2);
            assert!(seen.insert(id), "page {id} allocated twice");
        }
    }
    assert_eq!(seen.len(), 4 * 64);
    Ok(())
}
