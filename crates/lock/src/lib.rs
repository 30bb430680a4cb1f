//! Per-primary-key reader/writer lock registry.
//!
//! Locks are allocated lazily on first acquire and acquired non-blocking:
//! contention returns `LockContended` and the caller (the transaction layer)
//! aborts instead of waiting, so there is no waits-for graph and no deadlock.
//!
//! Fairness comes from `parking_lot`'s eventually-fair rwlock parking, which
//! keeps neither readers nor writers permanently starved.

use std::sync::Arc;

use common::{DbError, DbResult};
use hashbrown::HashMap;
use parking_lot::lock_api::RawRwLock as _;
use parking_lot::{Mutex, RawRwLock};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Exclusive,
}

struct KeyLock {
    raw: RawRwLock,
}

/// An acquired lock on one primary key. Dropping the handle releases it.
pub struct LockHandle {
    lock: Arc<KeyLock>,
    kind: LockKind,
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        // Safety: the handle's existence proves the raw lock is held in
        // exactly this mode, and `acquire` hands out one handle per grant.
        unsafe {
            match self.kind {
                LockKind::Shared => self.lock.raw.unlock_shared(),
                LockKind::Exclusive => self.lock.raw.unlock_exclusive(),
            }
        }
    }
}

/// Registry mapping primary keys to their rwlocks.
#[derive(Default)]
pub struct LockManager {
    locks: Mutex<HashMap<i64, Arc<KeyLock>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tries to lock `key` without blocking. `LockContended` on conflict.
    pub fn acquire(&self, key: i64, kind: LockKind) -> DbResult<LockHandle> {
        let lock = {
            let mut locks = self.locks.lock();
            locks
                .entry(key)
                .or_insert_with(|| Arc::new(KeyLock { raw: RawRwLock::INIT }))
                .clone()
        };

        let granted = match kind {
            LockKind::Shared => lock.raw.try_lock_shared(),
            LockKind::Exclusive => lock.raw.try_lock_exclusive(),
        };
        if !granted {
            return Err(DbError::LockContended);
        }
        Ok(LockHandle { lock, kind })
    }

    /// Releases a previously acquired handle.
    pub fn release(&self, handle: LockHandle) {
        drop(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_share_a_key() {
        let mgr = LockManager::new();
        let a = mgr.acquire(1, LockKind::Shared).unwrap();
        let b = mgr.acquire(1, LockKind::Shared).unwrap();
        mgr.release(a);
        mgr.release(b);
    }

    #[test]
    fn writer_excludes_everyone() {
        let mgr = LockManager::new();
        let w = mgr.acquire(1, LockKind::Exclusive).unwrap();

        assert!(matches!(
            mgr.acquire(1, LockKind::Shared),
            Err(DbError::LockContended)
        ));
        assert!(mgr.acquire(1, LockKind::Exclusive).is_err());

        mgr.release(w);
        assert!(mgr.acquire(1, LockKind::Exclusive).is_ok());
    }

    #[test]
    fn reader_blocks_writer_but_not_other_keys() {
        let mgr = LockManager::new();
        let r = mgr.acquire(1, LockKind::Shared).unwrap();

        assert!(mgr.acquire(1, LockKind::Exclusive).is_err());
        assert!(mgr.acquire(2, LockKind::Exclusive).is_ok());

        mgr.release(r);
    }

    #[test]
    fn dropping_a_handle_releases_the_lock() {
        let mgr = LockManager::new();
        {
            let _w = mgr.acquire(7, LockKind::Exclusive).unwrap();
            assert!(mgr.acquire(7, LockKind::Shared).is_err());
        }
        assert!(mgr.acquire(7, LockKind::Shared).is_ok());
    }

    #[test]
    fn handles_release_across_threads() {
        let mgr = std::sync::Arc::new(LockManager::new());
        let w = mgr.acquire(1, LockKind::Exclusive).unwrap();

        let mgr2 = mgr.clone();
        std::thread::spawn(move || drop(w)).join().unwrap();

        assert!(mgr2.acquire(1, LockKind::Exclusive).is_ok());
    }
}
