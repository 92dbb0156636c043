//! Alertable waits on futex-style words.
//!
//! Every blocking primitive in the crate (condition variables, semaphores,
//! join, sleep) parks on a [`WaitWord`]: a 64-bit state word behind a lock,
//! plus a condition variable. A managed thread that blocks publishes the word
//! it waits on in its control block, so a cancel request can wake it. The
//! wait then reports [`WaitStatus::Alerted`] and the caller decides, at its
//! checkpoint, whether the cancellation takes effect or the wait resumes.
//!
//! Lock order: `Control::waiting_on` before `WaitWord::word`. A waiter never
//! holds both.

#![allow(unsafe_code)]

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::thread::control::{self, Control};

/// Longest delay a single native wait accepts. Longer waits are chunked.
pub(crate) const MAX_NATIVE_DELAY: Duration = Duration::from_millis(0x7fff_ffff);

/// Why an alertable wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitStatus {
    /// The readiness predicate held.
    Ready,
    /// The timeout elapsed first.
    TimedOut,
    /// A cancel request interrupted the wait.
    Alerted,
}

/// A state word threads can block on.
pub(crate) struct WaitWord {
    word: Mutex<u64>,
    cv: Condvar,
}

impl WaitWord {
    pub(crate) const fn new(value: u64) -> Self {
        Self {
            word: parking_lot::const_mutex(value),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn load(&self) -> u64 {
        *self.word.lock()
    }

    /// Apply `f` to the word without waking anyone.
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut u64) -> R) -> R {
        f(&mut self.word.lock())
    }

    /// Apply `f` to the word and wake every waiter.
    pub(crate) fn update_wake_all<R>(&self, f: impl FnOnce(&mut u64) -> R) -> R {
        let mut word = self.word.lock();
        let ret = f(&mut word);
        self.cv.notify_all();
        ret
    }

    /// Apply `f` to the word and wake one waiter.
    pub(crate) fn update_wake_one<R>(&self, f: impl FnOnce(&mut u64) -> R) -> R {
        let mut word = self.word.lock();
        let ret = f(&mut word);
        self.cv.notify_one();
        ret
    }

    /// Wake all waiters so they re-check for pending alerts.
    fn alert(&self) {
        let _word = self.word.lock();
        self.cv.notify_all();
    }

    /// Block until `ready` holds. Not a checkpoint, never alerted.
    pub(crate) fn wait_until(&self, mut ready: impl FnMut(&mut u64) -> bool) {
        let mut word = self.word.lock();
        while !ready(&mut word) {
            self.cv.wait(&mut word);
        }
    }
}

/// The word a managed thread is currently blocked on.
#[derive(Clone, Copy)]
pub(crate) struct WaitTarget(*const WaitWord);

// SAFETY: the pointer is only dereferenced by `deliver_alert`, under the
// `waiting_on` lock of the control block it was published in. The publishing
// thread clears the slot under that same lock before it leaves
// `wait_alertable`, so the word outlives every dereference.
unsafe impl Send for WaitTarget {}

/// Wake the thread blocked on the word published in `slot`, if any.
pub(crate) fn deliver_alert(slot: &Mutex<Option<WaitTarget>>) {
    let target = slot.lock();
    if let Some(WaitTarget(word)) = *target {
        tracing::trace!("waking blocked thread for cancellation");
        // SAFETY: see `WaitTarget`; the slot lock is held for the whole call.
        unsafe { (*word).alert() };
    }
}

/// Publishes a wait target for the lifetime of one wait.
struct Registration<'a> {
    ctl: &'a Control,
}

impl<'a> Registration<'a> {
    fn new(ctl: &'a Control, word: &'a WaitWord) -> Self {
        *ctl.waiting_on().lock() = Some(WaitTarget(word));
        Self { ctl }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        *self.ctl.waiting_on().lock() = None;
    }
}

fn wait_on(
    ctl: Option<&Control>,
    word: &WaitWord,
    mut ready: impl FnMut(&mut u64) -> bool,
    timeout: Option<Duration>,
) -> WaitStatus {
    // Declared before the word guard so it is dropped after it.
    let _registration = ctl.map(|ctl| Registration::new(ctl, word));
    let deadline = timeout.map(|t| Instant::now() + t.min(MAX_NATIVE_DELAY));

    let mut guard = word.word.lock();
    loop {
        if ready(&mut guard) {
            return WaitStatus::Ready;
        }
        if ctl.is_some_and(Control::take_alert) {
            return WaitStatus::Alerted;
        }
        match deadline {
            None => word.cv.wait(&mut guard),
            Some(deadline) => {
                if word.cv.wait_until(&mut guard, deadline).timed_out() {
                    return if ready(&mut guard) {
                        WaitStatus::Ready
                    } else {
                        WaitStatus::TimedOut
                    };
                }
            }
        }
    }
}

/// Block until `ready` holds, `timeout` elapses or a cancel request arrives.
///
/// `ready` runs under the word lock and may consume state (a semaphore
/// decrements its count there). Unmanaged threads are never alerted.
pub(crate) fn wait_alertable(
    word: &WaitWord,
    ready: impl FnMut(&mut u64) -> bool,
    timeout: Option<Duration>,
) -> WaitStatus {
    let ctl = control::current();
    wait_on(ctl.as_deref(), word, ready, timeout)
}

/// Alertable sleep of at most `delay`.
pub(crate) fn nap(delay: Duration) {
    match control::current() {
        Some(ctl) => {
            let _ = wait_on(Some(&ctl), ctl.nap_word(), |_| false, Some(delay));
        }
        None => std::thread::sleep(delay.min(MAX_NATIVE_DELAY)),
    }
}
