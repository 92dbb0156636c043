//! Host load/unload hooks.
//!
//! Every process-wide primitive is const-initialized, so calling these is
//! optional. `attach` front-loads the work that would otherwise happen on
//! first use.

use std::num::NonZeroUsize;

use crate::{clock, config, sync};

/// Resolve the runtime configuration and pin the clock origin.
pub fn attach() {
    let config = config::runtime_config();
    clock::init_origin();
    tracing::debug!(
        stack_size = config.stack_size,
        cpus = cpu_count(),
        "threading layer attached"
    );
}

/// Report threads still parked on static mutexes.
///
/// Returns the number of such waiters; non-zero means a static mutex is
/// being torn down while in use.
pub fn detach() -> usize {
    let waiters = sync::static_waiters();
    if waiters > 0 {
        tracing::warn!(waiters, "detaching while threads wait on static mutexes");
    } else {
        tracing::debug!("threading layer detached");
    }
    waiters
}

/// Number of CPUs the process may run on, at least 1.
#[must_use]
pub fn cpu_count() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}
