//! One-shot and periodic timers.
//!
//! Each timer owns a worker thread that sleeps until the armed deadline and
//! then runs the callback with the timer state unlocked. Rescheduling bumps a
//! generation counter, so a callback that is already running never rearms a
//! schedule that was replaced underneath it.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::clock::{self, Tick};
use crate::error::ThreadError;
use crate::sys::wait::MAX_NATIVE_DELAY;

#[derive(Debug, Default)]
struct TimerState {
    generation: u64,
    deadline: Option<Tick>,
    interval: Tick,
    quit: bool,
}

#[derive(Default)]
struct TimerShared {
    state: Mutex<TimerState>,
    cv: Condvar,
}

/// A one-shot or periodic callback on a dedicated worker thread.
pub struct Timer {
    shared: Arc<TimerShared>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl Timer {
    /// Create a disarmed timer that will run `callback` on its own thread.
    pub fn new<F>(callback: F) -> Result<Self, ThreadError>
    where
        F: FnMut() + Send + 'static,
    {
        let shared = Arc::new(TimerShared::default());
        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("timer".into())
                .spawn(move || run(&shared, callback))
        }
        .map_err(worker_spawn_failed)?;
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Arm, rearm or disarm the timer.
    ///
    /// `value == 0` disarms. Otherwise the callback first runs `value` ticks
    /// from now, or at clock time `value` when `absolute` is set, then every
    /// `interval` ticks if `interval` is non-zero. Any previous schedule is
    /// cancelled first.
    pub fn schedule(&self, value: Tick, interval: Tick, absolute: bool) {
        let mut state = self.shared.state.lock();
        state.generation = state.generation.wrapping_add(1);
        if value == 0 {
            state.deadline = None;
        } else {
            let deadline = if absolute {
                value
            } else {
                clock::now().saturating_add(value)
            };
            state.deadline = Some(deadline);
            state.interval = interval.max(0);
        }
        tracing::trace!(value, interval, absolute, "timer scheduled");
        self.shared.cv.notify_all();
    }

    /// Whether a deadline is pending.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.shared.state.lock().deadline.is_some()
    }

    /// Missed periods. Always zero; missed periods are skipped silently.
    #[must_use]
    pub fn overrun_count(&self) -> u32 {
        0
    }

    /// Disarm and release the timer, waiting for a running callback unless
    /// called from that callback.
    pub fn destroy(self) {}
}

impl Drop for Timer {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.quit = true;
            state.deadline = None;
            self.shared.cv.notify_all();
        }
        if let Some(worker) = self.worker.take()
            && worker.thread().id() != std::thread::current().id()
            && worker.join().is_err()
        {
            tracing::error!("timer thread died");
        }
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("state", &*self.shared.state.lock())
            .finish()
    }
}

fn worker_spawn_failed(err: io::Error) -> ThreadError {
    tracing::warn!(error = %err, "could not start timer thread");
    ThreadError::from(err)
}

/// Next deadline after `now` on the grid `deadline + k * interval`.
fn next_period(deadline: Tick, interval: Tick, now: Tick) -> Tick {
    let next = deadline.saturating_add(interval);
    if next > now {
        return next;
    }
    let missed = now.saturating_sub(deadline) / interval;
    let next = deadline.saturating_add(interval.saturating_mul(missed.saturating_add(1)));
    // Saturation near `Tick::MIN` can land behind `now`.
    if next > now {
        next
    } else {
        now.saturating_add(interval)
    }
}

fn run<F: FnMut()>(shared: &TimerShared, mut callback: F) {
    let mut state = shared.state.lock();
    loop {
        if state.quit {
            break;
        }
        let Some(deadline) = state.deadline else {
            shared.cv.wait(&mut state);
            continue;
        };
        let now = clock::now();
        if now < deadline {
            let delay = clock::to_duration(deadline - now).min(MAX_NATIVE_DELAY);
            let _ = shared.cv.wait_for(&mut state, delay);
            continue;
        }

        let generation = state.generation;
        MutexGuard::unlocked(&mut state, || {
            if panic::catch_unwind(AssertUnwindSafe(&mut callback)).is_err() {
                tracing::error!("timer callback panicked");
            }
        });
        if state.generation != generation {
            continue;
        }
        state.deadline = if state.interval > 0 {
            Some(next_period(deadline, state.interval, clock::now()))
        } else {
            None
        };
    }
}
