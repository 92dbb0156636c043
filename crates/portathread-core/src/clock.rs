//! Monotonic clock, wall clock and cancellable sleeps.
//!
//! All timestamps are [`Tick`]s at [`CLOCK_FREQ`] ticks per second
//! (microseconds). The monotonic origin is fixed the first time any clock
//! function runs; `now()` never returns less than 1.

use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::sys::wait;
use crate::thread;

/// Timestamp or delay in clock ticks.
pub type Tick = i64;

/// Clock ticks per second.
pub const CLOCK_FREQ: Tick = 1_000_000;

static ORIGIN: OnceLock<Instant> = OnceLock::new();

fn origin() -> Instant {
    *ORIGIN.get_or_init(Instant::now)
}

/// Pin the monotonic origin. Called by [`crate::lifecycle::attach`].
pub(crate) fn init_origin() {
    let _ = origin();
}

/// Current monotonic timestamp.
#[must_use]
pub fn now() -> Tick {
    from_duration(origin().elapsed()).saturating_add(1)
}

/// Current wall-clock time in ticks since the Unix epoch.
#[must_use]
pub fn wall_now() -> Tick {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(since) => from_duration(since),
        Err(before) => -from_duration(before.duration()),
    }
}

/// Convert a duration to ticks, saturating at `Tick::MAX`.
#[must_use]
pub fn from_duration(d: Duration) -> Tick {
    Tick::try_from(d.as_micros()).unwrap_or(Tick::MAX)
}

/// Convert ticks to a duration. Negative values clamp to zero.
#[must_use]
pub fn to_duration(ticks: Tick) -> Duration {
    Duration::from_micros(u64::try_from(ticks).unwrap_or(0))
}

/// Ticks in `ms` milliseconds.
#[must_use]
pub const fn from_millis(ms: i64) -> Tick {
    ms.saturating_mul(CLOCK_FREQ / 1000)
}

/// Sleep until the monotonic clock reaches `deadline`.
///
/// Cancellation checkpoint, both on entry and between every bounded chunk.
pub fn sleep_until(deadline: Tick) {
    thread::test_cancel();
    loop {
        let remaining = deadline.saturating_sub(now());
        if remaining <= 0 {
            break;
        }
        wait::nap(to_duration(remaining).min(wait::MAX_NATIVE_DELAY));
        thread::test_cancel();
    }
}

/// Sleep for `delay` ticks. Cancellation checkpoint.
pub fn sleep(delay: Tick) {
    sleep_until(now().saturating_add(delay));
}
