#![forbid(unsafe_code)]
//! In-process synchronization for the page store: the shared/exclusive
//! commit lock and the lightweight header latch.

use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Guard for the commit lock held in shared mode.
pub type SharedCommitGuard = ArcRwLockReadGuard<RawRwLock, ()>;
/// Guard for the commit lock held in exclusive mode.
pub type ExclusiveCommitGuard = ArcRwLockWriteGuard<RawRwLock, ()>;

/// Shared/exclusive lock serializing commit-number assignment while letting
/// allocation and deletion traffic proceed concurrently.
///
/// Commit holds the lock exclusively only for the instant it mints the next
/// commit number, then downgrades to shared for the slow flush work.
#[derive(Clone, Default)]
pub struct CommitLock {
    inner: Arc<RwLock<()>>,
}

impl CommitLock {
    /// Creates a new, unheld commit lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock in shared mode, blocking while an exclusive holder
    /// is present.
    pub fn shared(&self) -> SharedCommitGuard {
        self.inner.read_arc()
    }

    /// Acquires the lock in exclusive mode, blocking out all shared holders.
    pub fn exclusive(&self) -> ExclusiveCommitGuard {
        self.inner.write_arc()
    }

    /// Atomically converts an exclusive hold into a shared one without
    /// letting another exclusive acquirer slip in between.
    pub fn downgrade(guard: ExclusiveCommitGuard) -> SharedCommitGuard {
        ArcRwLockWriteGuard::downgrade(guard)
    }
}

/// Lightweight exclusive/shared latch guarding a small piece of state.
///
/// Finer-grained than [`CommitLock`]: readers of header state do not contend
/// with allocation traffic.
pub struct Latch<T> {
    inner: RwLock<T>,
}

impl<T> Latch<T> {
    /// Creates a latch around `value`.
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(value),
        }
    }

    /// Acquires the latch in shared mode.
    pub fn shared(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read()
    }

    /// Acquires the latch in exclusive mode.
    pub fn exclusive(&self) -> RwLockWriteGuard<'_, T> {
        self.inner.write()
    }
}
