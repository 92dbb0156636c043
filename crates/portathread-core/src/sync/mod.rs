//! Synchronization primitives.

mod cond;
mod mutex;
mod rwlock;
mod sem;

pub use cond::{Cond, CondClock};
pub use mutex::{
    Mutex, MutexContractOp, MutexContractOutcome, MutexContractState, MutexGuard, MutexKind,
    mutex_contract_transition,
};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use sem::{SEM_VALUE_MAX, Semaphore};

pub(crate) use mutex::static_waiters;

/// A lock a [`Cond`] can release while waiting and re-acquire afterwards.
pub trait RawLock {
    /// Acquire the lock. Must not be a cancellation checkpoint.
    fn raw_lock(&self);
    /// Release a lock held by the caller.
    fn raw_unlock(&self);
}
