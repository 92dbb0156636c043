//! Per-thread control block.
//!
//! Every managed thread owns one `Control`, shared through an `Arc` between
//! the thread itself and whoever holds its handle. The block carries the
//! cancellation flags, the cleanup-handler stack head, the startup gate and
//! the completion word joiners block on.

use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU64, Ordering};

use parking_lot::Mutex;

use super::cancel::CleanupHandler;
use crate::sys::wait::{self, WaitTarget, WaitWord};

/// Thread state: created, trampoline hasn't reached the start gate yet.
pub const THREAD_STARTING: u64 = 0;
/// Thread state: trampoline is running (or about to run) the entry function.
pub const THREAD_RUNNING: u64 = 1;
/// Thread state: entry returned or was cancelled, cleanup path complete.
pub const THREAD_FINISHED: u64 = 2;

const GATE_SUSPENDED: u64 = 0;
const GATE_STARTED: u64 = 1;
const GATE_RESUMED: u64 = 2;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<Arc<Control>>> = const { RefCell::new(None) };
    static SELF_ID: Cell<u64> = const { Cell::new(0) };
}

pub(crate) struct Control {
    id: u64,
    name: Option<String>,
    /// Kernel TID, published by the thread before it parks at the gate.
    tid: AtomicI32,
    detached: AtomicBool,
    /// Whether cancellation may act at the next checkpoint. Owner-thread only.
    killable: AtomicBool,
    /// Pending cancellation request.
    killed: AtomicBool,
    /// Pending wake-up for the next alertable wait.
    alerted: AtomicBool,
    waiting_on: Mutex<Option<WaitTarget>>,
    /// Innermost cleanup handler. Owner-thread only.
    cleaners: AtomicPtr<CleanupHandler<'static>>,
    gate: WaitWord,
    state: WaitWord,
    nap: WaitWord,
}

impl Control {
    pub(crate) fn new(detached: bool, name: Option<String>) -> Self {
        Self {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            name,
            tid: AtomicI32::new(0),
            detached: AtomicBool::new(detached),
            killable: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            alerted: AtomicBool::new(false),
            waiting_on: Mutex::new(None),
            cleaners: AtomicPtr::new(std::ptr::null_mut()),
            gate: WaitWord::new(GATE_SUSPENDED),
            state: WaitWord::new(THREAD_STARTING),
            nap: WaitWord::new(0),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn tid(&self) -> i32 {
        self.tid.load(Ordering::Acquire)
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    pub(crate) fn set_detached(&self) {
        self.detached.store(true, Ordering::Release);
    }

    pub(crate) fn killable(&self) -> bool {
        self.killable.load(Ordering::Relaxed)
    }

    /// Store a new `killable` value, returning the previous one.
    pub(crate) fn swap_killable(&self, killable: bool) -> bool {
        self.killable.swap(killable, Ordering::Relaxed)
    }

    pub(crate) fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Mark the thread cancelled and wake it if it is blocked.
    pub(crate) fn request_cancel(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.alerted.store(true, Ordering::SeqCst);
        wait::deliver_alert(&self.waiting_on);
    }

    /// Consume a pending alert.
    pub(crate) fn take_alert(&self) -> bool {
        self.alerted.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn waiting_on(&self) -> &Mutex<Option<WaitTarget>> {
        &self.waiting_on
    }

    pub(crate) fn cleaners(&self) -> &AtomicPtr<CleanupHandler<'static>> {
        &self.cleaners
    }

    pub(crate) fn nap_word(&self) -> &WaitWord {
        &self.nap
    }

    pub(crate) fn state_word(&self) -> &WaitWord {
        &self.state
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state.load() == THREAD_FINISHED
    }

    /// Child side: publish the TID and report that the thread is up.
    pub(crate) fn announce_started(&self, tid: i32) {
        self.tid.store(tid, Ordering::Release);
        self.state.update_wake_all(|s| *s = THREAD_RUNNING);
        self.gate.update_wake_all(|g| *g = GATE_STARTED);
    }

    /// Creator side: wait until the child has published its TID.
    pub(crate) fn wait_started(&self) {
        self.gate.wait_until(|g| *g >= GATE_STARTED);
    }

    /// Creator side: let the child run its entry function.
    pub(crate) fn resume(&self) {
        self.gate.update_wake_all(|g| *g = GATE_RESUMED);
    }

    /// Child side: park until the creator resumes us.
    pub(crate) fn wait_resumed(&self) {
        self.gate.wait_until(|g| *g == GATE_RESUMED);
    }

    /// Child side: the cleanup path is complete; release joiners.
    pub(crate) fn finish(&self) {
        self.state.update_wake_all(|s| *s = THREAD_FINISHED);
    }
}

/// Control block of the calling thread, `None` for unmanaged threads.
pub(crate) fn current() -> Option<Arc<Control>> {
    CURRENT.try_with(|c| c.borrow().clone()).ok().flatten()
}

/// Register `ctl` as the calling thread's control block.
pub(crate) fn enter(ctl: &Arc<Control>) {
    SELF_ID.with(|id| id.set(ctl.id()));
    CURRENT.with(|c| *c.borrow_mut() = Some(Arc::clone(ctl)));
}

/// Unregister the calling thread's control block.
pub(crate) fn leave() {
    let _ = CURRENT.try_with(|c| c.borrow_mut().take());
}

/// Stable, non-zero identifier of the calling thread.
///
/// Managed threads report the same id as their [`super::Thread::id`];
/// unmanaged threads get one assigned on first use.
#[must_use]
pub fn self_id() -> u64 {
    SELF_ID.with(|id| {
        if id.get() == 0 {
            id.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
        }
        id.get()
    })
}
