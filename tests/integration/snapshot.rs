//! Snapshot streaming and restore.

use std::io::Cursor;

use tempfile::tempdir;
use umbra::primitives::store::{restore_from_snapshot, PageStore, StoreOptions};
use umbra::types::{PageId, Result};

const PAGE_SIZE: u32 = 512;

fn options() -> StoreOptions {
    StoreOptions {
        page_size: PAGE_SIZE,
        destroy: false,
    }
}

#[test]
fn snapshot_restores_an_identical_store() -> Result<()> {
    let dir = tempdir().unwrap();
    let source_path = dir.path().join("source.db");
    let restored_path = dir.path().join("restored.db");

    let store = PageStore::open_path(&source_path, options())?;
    let mut pages = Vec::new();
    for tag in 0..4u8 {
        let id = store.alloc_page()?;
        store.write_page(id, &vec![tag + 0x30; PAGE_SIZE as usize])?;
        pages.push(id);
    }
    store.delete_page(pages[1])?;
    store.commit(None)?;
    let stats = store.stats()?;

    let mut stream = Vec::new();
    store.begin_snapshot(&mut stream, 8)?;

    let restored = restore_from_snapshot(&mut Cursor::new(stream), &restored_path)?;
    assert_eq!(restored.page_size(), PAGE_SIZE);
    assert_eq!(restored.stats()?, stats);
    assert_eq!(restored.commit_number(), store.commit_number());
    for (idx, &id) in pages.iter().enumerate() {
        if idx == 1 {
            continue;
        }
        let mut back = vec![0u8; PAGE_SIZE as usize];
        restored.read_page(id, &mut back)?;
        assert!(back.iter().all(|&b| b == idx as u8 + 0x30));
    }
    Ok(())
}

#[test]
fn snapshot_reflects_only_committed_state() -> Result<()> {
    let dir = tempdir().unwrap();
    let source_path = dir.path().join("committed.db");
    let restored_path = dir.path().join("restored.db");

    let store = PageStore::open_path(&source_path, options())?;
    let id = store.alloc_page()?;
    store.write_page(id, &vec![7u8; PAGE_SIZE as usize])?;
    store.commit(None)?;
    let committed = store.stats()?;

    // Allocations after the commit are invisible to the snapshot.
    let extra = store.alloc_page()?;
    store.write_page(extra, &vec![8u8; PAGE_SIZE as usize])?;

    let mut stream = Vec::new();
    store.begin_snapshot(&mut stream, 2)?;
    let restored = restore_from_snapshot(&mut Cursor::new(stream), &restored_path)?;
    assert_eq!(restored.stats()?, committed);
    assert_eq!(restored.alloc_page_count()?, committed.total_pages);
    Ok(())
}

#[test]
fn snapshot_streams_with_small_clusters() -> Result<()> {
    let dir = tempdir().unwrap();
    let source_path = dir.path().join("clusters.db");
    let restored_path = dir.path().join("restored.db");

    let store = PageStore::open_path(&source_path, options())?;
    for tag in 0..5u8 {
        let id = store.alloc_page()?;
        store.write_page(id, &vec![tag; PAGE_SIZE as usize])?;
    }
    store.commit(None)?;

    let mut stream = Vec::new();
    store.begin_snapshot(&mut stream, 1)?;
    let restored = restore_from_snapshot(&mut Cursor::new(stream), &restored_path)?;
    let mut back = vec![0u8; PAGE_SIZE as usize];
    restored.read_page(PageId(4), &mut back)?;
    assert!(back.iter().all(|&b| b == 2));
    Ok(())
}
