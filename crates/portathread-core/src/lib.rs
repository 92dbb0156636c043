//! # portathread-core
//!
//! Portable threading primitives with cooperative cancellation.
//!
//! This crate provides mutexes (dynamic and statically initialized),
//! condition variables, semaphores, read/write locks, thread-local storage
//! keys with per-thread destructors, managed threads with checkpoint-based
//! cancellation, a monotonic clock and one-shot/periodic timers.
//!
//! Cancellation never preempts a thread. A cancel request only sets a flag;
//! the target acts on it at a checkpoint (condition wait, semaphore wait,
//! join, sleep, [`thread::test_cancel`]) by running its cleanup handlers and
//! unwinding back to the thread entry trampoline.

#![deny(unsafe_code)]

pub mod clock;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod sync;
pub(crate) mod sys;
pub mod thread;
pub mod timer;

pub use clock::{CLOCK_FREQ, Tick};
pub use error::ThreadError;
pub use sync::{Cond, CondClock, Mutex, MutexGuard, RawLock, RwLock, Semaphore};
pub use thread::{
    Builder, JoinHandle, Priority, Thread, ThreadExit, TlsKey, pop_cleanup, restore_cancel,
    save_cancel, spawn, spawn_detached, test_cancel, with_cleanup, with_cleanup_run,
};
pub use timer::Timer;
