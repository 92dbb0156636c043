//! Mutexes.
//!
//! Two flavors share one type:
//! - dynamic mutexes delegate to a native fast lock; lock/unlock are never
//!   cancellation checkpoints.
//! - static mutexes are const-initialized and usable from a `static`. They
//!   keep a `locked` flag guarded by the process-wide super-mutex and wait
//!   for it on the super-condvar. `lock()` is a checkpoint on entry; the wait
//!   itself runs with cancellation saved.
//!
//! The super-mutex is a distinct, native-only type, so the static path never
//! recurses into itself.

#![allow(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use parking_lot::lock_api::RawMutex as _;

use super::RawLock;
use super::cond::Cond;
use crate::error::{ThreadError, fatal};
use crate::thread::{restore_cancel, save_cancel, test_cancel};

// ---------------------------------------------------------------------------
// Transition contract
// ---------------------------------------------------------------------------

/// Which locking path a mutex uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexKind {
    Dynamic,
    Static,
}

/// Abstract mutex state as seen by the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexContractState {
    Unlocked,
    /// Locked by the calling thread.
    LockedBySelf,
    /// Locked by a different thread.
    LockedByOther,
    /// Destroyed. Unreachable through `destroy(self)`, listed for completeness.
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexContractOp {
    Lock,
    TryLock,
    Unlock,
    Destroy,
}

/// Deterministic result of applying an operation in a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexContractOutcome {
    /// State after the operation completes.
    pub next: MutexContractState,
    /// Error reported, `None` on success.
    pub error: Option<ThreadError>,
    /// Whether the operation may wait for another thread.
    pub blocks: bool,
    /// Whether the operation is a cancellation checkpoint.
    pub checkpoint: bool,
}

const fn outcome(
    next: MutexContractState,
    error: Option<ThreadError>,
    blocks: bool,
    checkpoint: bool,
) -> MutexContractOutcome {
    MutexContractOutcome {
        next,
        error,
        blocks,
        checkpoint,
    }
}

/// Transition table for both mutex kinds.
///
/// Mutexes are not recursive: relocking from the owner deadlocks. Ownership
/// is not tracked, so unlocking a mutex another thread holds releases it.
/// Unlocking an unlocked mutex and destroying a held one are reported as
/// errors here; the runtime treats both as fatal.
#[must_use]
pub const fn mutex_contract_transition(
    kind: MutexKind,
    state: MutexContractState,
    op: MutexContractOp,
) -> MutexContractOutcome {
    use MutexContractState::{Destroyed, LockedByOther, LockedBySelf, Unlocked};

    let lock_checkpoint = matches!(kind, MutexKind::Static);
    match state {
        Destroyed => outcome(Destroyed, Some(ThreadError::InvalidArgument), false, false),
        Unlocked => match op {
            MutexContractOp::Lock => outcome(LockedBySelf, None, false, lock_checkpoint),
            MutexContractOp::TryLock => outcome(LockedBySelf, None, false, false),
            MutexContractOp::Unlock => {
                outcome(Unlocked, Some(ThreadError::PermissionDenied), false, false)
            }
            MutexContractOp::Destroy => outcome(Destroyed, None, false, false),
        },
        LockedBySelf => match op {
            MutexContractOp::Lock => outcome(LockedBySelf, None, true, lock_checkpoint),
            MutexContractOp::TryLock => {
                outcome(LockedBySelf, Some(ThreadError::Busy), false, false)
            }
            MutexContractOp::Unlock => outcome(Unlocked, None, false, false),
            MutexContractOp::Destroy => {
                outcome(LockedBySelf, Some(ThreadError::Busy), false, false)
            }
        },
        LockedByOther => match op {
            MutexContractOp::Lock => outcome(LockedBySelf, None, true, lock_checkpoint),
            MutexContractOp::TryLock => {
                outcome(LockedByOther, Some(ThreadError::Busy), false, false)
            }
            MutexContractOp::Unlock => outcome(Unlocked, None, false, false),
            MutexContractOp::Destroy => {
                outcome(LockedByOther, Some(ThreadError::Busy), false, false)
            }
        },
    }
}

// ---------------------------------------------------------------------------
// Super-lock
// ---------------------------------------------------------------------------

/// Native lock serializing every static mutex.
pub(crate) struct SuperMutex(parking_lot::RawMutex);

impl SuperMutex {
    const fn new() -> Self {
        Self(parking_lot::RawMutex::INIT)
    }
}

impl RawLock for SuperMutex {
    fn raw_lock(&self) {
        self.0.lock();
    }

    fn raw_unlock(&self) {
        // SAFETY: only called by static-mutex paths that took the lock above
        // on this thread.
        unsafe { self.0.unlock() };
    }
}

static SUPER_MUTEX: SuperMutex = SuperMutex::new();
static SUPER_COND: Cond = Cond::new();

/// Threads currently parked on the super-condvar.
static STATIC_WAITERS: AtomicUsize = AtomicUsize::new(0);

/// Number of threads blocked on any static mutex.
pub(crate) fn static_waiters() -> usize {
    STATIC_WAITERS.load(Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Mutex
// ---------------------------------------------------------------------------

/// Non-recursive mutex.
pub struct Mutex {
    raw: parking_lot::RawMutex,
    kind: MutexKind,
    /// Held flag. The static path writes it under the super-mutex; the
    /// dynamic path sets it after acquiring `raw` and clears it by CAS in
    /// `unlock`, so one acquisition is released at most once.
    locked: AtomicBool,
    /// Static path only; waiters on this mutex. Written under the super-mutex.
    contention: AtomicU32,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    /// A dynamic mutex.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_kind(MutexKind::Dynamic)
    }

    /// A dynamic mutex. Recursive locking is not supported; this exists for
    /// callers that ask for it and never relock.
    #[must_use]
    pub const fn new_recursive() -> Self {
        Self::new()
    }

    /// A static mutex, usable as `static M: Mutex = Mutex::new_static();`.
    #[must_use]
    pub const fn new_static() -> Self {
        Self::with_kind(MutexKind::Static)
    }

    const fn with_kind(kind: MutexKind) -> Self {
        Self {
            raw: parking_lot::RawMutex::INIT,
            kind,
            locked: AtomicBool::new(false),
            contention: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> MutexKind {
        self.kind
    }

    /// Whether some thread holds the mutex. A snapshot, for diagnostics.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Destroy the mutex. Destroying a held mutex is fatal.
    pub fn destroy(self) {
        if self.is_locked() {
            fatal("destroying a locked mutex");
        }
    }

    /// Acquire the mutex, blocking while another thread holds it.
    ///
    /// Static mutexes check for cancellation on entry; dynamic ones never do.
    pub fn lock(&self) {
        if self.kind == MutexKind::Static {
            test_cancel();
        }
        self.acquire();
    }

    /// Acquire without the entry checkpoint.
    fn acquire(&self) {
        match self.kind {
            MutexKind::Dynamic => {
                self.raw.lock();
                self.locked.store(true, Ordering::Relaxed);
            }
            MutexKind::Static => {
                let saved = save_cancel();
                SUPER_MUTEX.raw_lock();
                while self.locked.load(Ordering::Relaxed) {
                    self.contention.fetch_add(1, Ordering::Relaxed);
                    STATIC_WAITERS.fetch_add(1, Ordering::Relaxed);
                    SUPER_COND.wait(&SUPER_MUTEX);
                    STATIC_WAITERS.fetch_sub(1, Ordering::Relaxed);
                    self.contention.fetch_sub(1, Ordering::Relaxed);
                }
                self.locked.store(true, Ordering::Relaxed);
                SUPER_MUTEX.raw_unlock();
                restore_cancel(saved);
            }
        }
    }

    /// Acquire only if free. Never blocks; `Busy` when held.
    pub fn try_lock(&self) -> Result<(), ThreadError> {
        match self.kind {
            MutexKind::Dynamic => {
                if self.raw.try_lock() {
                    self.locked.store(true, Ordering::Relaxed);
                    Ok(())
                } else {
                    Err(ThreadError::Busy)
                }
            }
            MutexKind::Static => {
                SUPER_MUTEX.raw_lock();
                let was_locked = self.locked.swap(true, Ordering::Relaxed);
                SUPER_MUTEX.raw_unlock();
                if was_locked {
                    Err(ThreadError::Busy)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Release the mutex. Unlocking an unlocked mutex is fatal.
    pub fn unlock(&self) {
        match self.kind {
            MutexKind::Dynamic => {
                if !self.claim_release() {
                    fatal("unlocking an unlocked mutex");
                }
                // SAFETY: `raw` is held, and winning the claim makes this the
                // only release of the current acquisition.
                unsafe { self.raw.unlock() };
            }
            MutexKind::Static => {
                SUPER_MUTEX.raw_lock();
                if !self.locked.swap(false, Ordering::Relaxed) {
                    fatal("unlocking an unlocked static mutex");
                }
                if self.contention.load(Ordering::Relaxed) > 0 {
                    SUPER_COND.broadcast();
                }
                SUPER_MUTEX.raw_unlock();
            }
        }
    }

    /// Take the held flag of a dynamic mutex. Exactly one caller wins per
    /// acquisition.
    fn claim_release(&self) -> bool {
        self.locked
            .compare_exchange(true, false, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// Lock and return a guard that unlocks on drop.
    pub fn guard(&self) -> MutexGuard<'_> {
        self.lock();
        MutexGuard { mutex: self }
    }

    /// Like [`Mutex::try_lock`], returning a guard on success.
    pub fn try_guard(&self) -> Result<MutexGuard<'_>, ThreadError> {
        self.try_lock()?;
        Ok(MutexGuard { mutex: self })
    }
}

impl RawLock for Mutex {
    fn raw_lock(&self) {
        self.acquire();
    }

    fn raw_unlock(&self) {
        self.unlock();
    }
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("kind", &self.kind)
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Holds a [`Mutex`] locked until dropped.
#[must_use = "the mutex unlocks as soon as the guard is dropped"]
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl<'a> MutexGuard<'a> {
    /// The locked mutex, for passing to [`Cond::wait`].
    #[must_use]
    pub fn mutex(&self) -> &'a Mutex {
        self.mutex
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl std::fmt::Debug for MutexGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutexGuard").field("mutex", self.mutex).finish()
    }
}
