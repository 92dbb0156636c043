//! Counting semaphores.

use crate::error::ThreadError;
use crate::sys::wait::{self, WaitStatus, WaitWord};
use crate::thread::test_cancel;

/// Largest count a semaphore holds.
pub const SEM_VALUE_MAX: u32 = 0x7fff_ffff;

/// Counting semaphore bounded at [`SEM_VALUE_MAX`].
pub struct Semaphore {
    count: WaitWord,
}

impl Semaphore {
    /// A semaphore with `initial` units. Counts above [`SEM_VALUE_MAX`] are
    /// invalid.
    pub fn new(initial: u32) -> Result<Self, ThreadError> {
        if initial > SEM_VALUE_MAX {
            return Err(ThreadError::InvalidArgument);
        }
        Ok(Self {
            count: WaitWord::new(u64::from(initial)),
        })
    }

    pub fn destroy(self) {}

    /// Add one unit and wake one waiter. Saturates at [`SEM_VALUE_MAX`].
    pub fn post(&self) {
        let saturated = self.count.update_wake_one(|count| {
            if *count >= u64::from(SEM_VALUE_MAX) {
                true
            } else {
                *count += 1;
                false
            }
        });
        if saturated {
            tracing::warn!("semaphore count saturated, post dropped");
        }
    }

    /// Take one unit, blocking while the count is zero.
    ///
    /// Cancellation checkpoint.
    pub fn wait(&self) {
        loop {
            test_cancel();
            if wait::wait_alertable(&self.count, take_one, None) == WaitStatus::Ready {
                return;
            }
        }
    }

    /// Take one unit if available; `Busy` otherwise.
    pub fn try_wait(&self) -> Result<(), ThreadError> {
        if self.count.update(take_one) {
            Ok(())
        } else {
            Err(ThreadError::Busy)
        }
    }

    /// Current count. A snapshot.
    #[must_use]
    pub fn value(&self) -> u32 {
        u32::try_from(self.count.load()).unwrap_or(SEM_VALUE_MAX)
    }
}

fn take_one(count: &mut u64) -> bool {
    if *count > 0 {
        *count -= 1;
        true
    } else {
        false
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("value", &self.value())
            .finish()
    }
}
