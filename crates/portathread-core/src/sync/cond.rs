//! Condition variables.
//!
//! A condition variable is a sequence counter. Waiters remember the value
//! they saw before releasing their lock and sleep until it changes; a signal
//! bumps it. Every waiter present at a signal is released, so `signal` and
//! `broadcast` coincide and a signal is never lost between unlocking the
//! lock and starting to sleep.

use crate::clock::{self, Tick};
use crate::error::ThreadError;
use crate::sync::RawLock;
use crate::sys::wait::{self, WaitStatus, WaitWord};
use crate::thread::test_cancel;

/// Clock that timed-wait deadlines are expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CondClock {
    /// [`clock::now`].
    #[default]
    Monotonic,
    /// [`clock::wall_now`].
    Daytime,
}

impl CondClock {
    fn now(self) -> Tick {
        match self {
            Self::Monotonic => clock::now(),
            Self::Daytime => clock::wall_now(),
        }
    }
}

/// Manual-reset condition variable; `signal` wakes every current waiter.
pub struct Cond {
    seq: WaitWord,
    clock: CondClock,
}

impl Default for Cond {
    fn default() -> Self {
        Self::new()
    }
}

impl Cond {
    /// A condition variable with monotonic deadlines.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            seq: WaitWord::new(0),
            clock: CondClock::Monotonic,
        }
    }

    /// A condition variable with wall-clock deadlines.
    #[must_use]
    pub const fn new_daytime() -> Self {
        Self {
            seq: WaitWord::new(0),
            clock: CondClock::Daytime,
        }
    }

    #[must_use]
    pub const fn clock(&self) -> CondClock {
        self.clock
    }

    pub fn destroy(self) {}

    /// Wake at least one waiter. Currently wakes all of them.
    pub fn signal(&self) {
        self.broadcast();
    }

    /// Wake every thread waiting right now.
    pub fn broadcast(&self) {
        self.seq.update_wake_all(|s| *s = s.wrapping_add(1));
    }

    /// Release `lock`, wait for a signal, then re-acquire `lock`.
    ///
    /// Cancellation checkpoint. If the thread is cancelled here, `lock` is
    /// held again before the cleanup handlers run.
    pub fn wait<L: RawLock + ?Sized>(&self, lock: &L) {
        test_cancel();
        let start = self.seq.load();
        lock.raw_unlock();
        loop {
            match wait::wait_alertable(&self.seq, |s| *s != start, None) {
                WaitStatus::Ready | WaitStatus::TimedOut => break,
                WaitStatus::Alerted => self.checkpoint(lock),
            }
        }
        lock.raw_lock();
    }

    /// Like [`Cond::wait`], giving up at `deadline` in this variable's clock.
    ///
    /// A deadline already in the past checks once and returns `TimedOut`
    /// unless a signal already arrived.
    pub fn timed_wait<L: RawLock + ?Sized>(
        &self,
        lock: &L,
        deadline: Tick,
    ) -> Result<(), ThreadError> {
        test_cancel();
        let start = self.seq.load();
        lock.raw_unlock();
        let result = loop {
            let remaining = deadline.saturating_sub(self.clock.now());
            if remaining <= 0 {
                break if self.seq.load() != start {
                    Ok(())
                } else {
                    Err(ThreadError::TimedOut)
                };
            }
            // Delays past the native maximum are clamped inside the wait;
            // the loop picks up the rest.
            let delay = clock::to_duration(remaining);
            match wait::wait_alertable(&self.seq, |s| *s != start, Some(delay)) {
                WaitStatus::Ready => break Ok(()),
                WaitStatus::TimedOut => {}
                WaitStatus::Alerted => self.checkpoint(lock),
            }
        };
        lock.raw_lock();
        result
    }

    /// Act on a pending cancel with `lock` held, as the caller expects.
    fn checkpoint<L: RawLock + ?Sized>(&self, lock: &L) {
        lock.raw_lock();
        test_cancel();
        lock.raw_unlock();
    }
}

impl std::fmt::Debug for Cond {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cond").field("clock", &self.clock).finish()
    }
}
