//! Read/write locks built from a mutex and a condition variable.
//!
//! Any number of readers or one writer. Acquisition is not a cancellation
//! point and release gives no fairness: a steady stream of readers can
//! starve a writer.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::cond::Cond;
use super::mutex::Mutex;
use crate::error::fatal;
use crate::thread::{restore_cancel, save_cancel, self_id};

/// Many readers or one writer.
pub struct RwLock {
    mutex: Mutex,
    wait: Cond,
    /// Readers holding the lock. Written under `mutex`.
    readers: AtomicUsize,
    /// Id of the writing thread, zero when none. Written under `mutex`.
    writer: AtomicU64,
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RwLock {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mutex: Mutex::new(),
            wait: Cond::new(),
            readers: AtomicUsize::new(0),
            writer: AtomicU64::new(0),
        }
    }

    pub fn destroy(self) {
        if self.readers.load(Ordering::Relaxed) != 0 || self.writer.load(Ordering::Relaxed) != 0 {
            fatal("destroying a held rwlock");
        }
    }

    /// Acquire shared access.
    pub fn read_lock(&self) {
        let _g = self.mutex.guard();
        let saved = save_cancel();
        while self.writer.load(Ordering::Relaxed) != 0 {
            self.wait.wait(&self.mutex);
        }
        let readers = self.readers.load(Ordering::Relaxed);
        if readers == usize::MAX {
            fatal("rwlock reader count overflow");
        }
        self.readers.store(readers + 1, Ordering::Relaxed);
        restore_cancel(saved);
    }

    /// Acquire exclusive access.
    pub fn write_lock(&self) {
        let _g = self.mutex.guard();
        let saved = save_cancel();
        while self.readers.load(Ordering::Relaxed) > 0 || self.writer.load(Ordering::Relaxed) != 0 {
            self.wait.wait(&self.mutex);
        }
        self.writer.store(self_id(), Ordering::Relaxed);
        restore_cancel(saved);
    }

    /// Release whichever access the caller holds.
    pub fn unlock(&self) {
        let _g = self.mutex.guard();
        if self.writer.load(Ordering::Relaxed) != 0 {
            self.writer.store(0, Ordering::Relaxed);
            self.wait.broadcast();
        } else {
            let readers = self.readers.load(Ordering::Relaxed);
            if readers == 0 {
                fatal("unlocking an unlocked rwlock");
            }
            self.readers.store(readers - 1, Ordering::Relaxed);
            if readers == 1 {
                self.wait.signal();
            }
        }
    }

    /// Shared access until the guard drops.
    pub fn read(&self) -> RwLockReadGuard<'_> {
        self.read_lock();
        RwLockReadGuard { lock: self }
    }

    /// Exclusive access until the guard drops.
    pub fn write(&self) -> RwLockWriteGuard<'_> {
        self.write_lock();
        RwLockWriteGuard { lock: self }
    }

    /// Number of readers. A snapshot.
    #[must_use]
    pub fn readers(&self) -> usize {
        self.readers.load(Ordering::Relaxed)
    }

    /// Whether a writer holds the lock. A snapshot.
    #[must_use]
    pub fn is_write_locked(&self) -> bool {
        self.writer.load(Ordering::Relaxed) != 0
    }
}

impl std::fmt::Debug for RwLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwLock")
            .field("readers", &self.readers())
            .field("writer", &self.writer.load(Ordering::Relaxed))
            .finish()
    }
}

#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct RwLockReadGuard<'a> {
    lock: &'a RwLock,
}

impl Drop for RwLockReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct RwLockWriteGuard<'a> {
    lock: &'a RwLock,
}

impl Drop for RwLockWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
