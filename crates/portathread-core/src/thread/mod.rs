//! Managed threads, cooperative cancellation and thread-local storage.

mod cancel;
pub(crate) mod control;
mod spawn;
pub mod tls;

pub use cancel::{
    Cancelled, pop_cleanup, restore_cancel, save_cancel, test_cancel, with_cleanup,
    with_cleanup_run,
};
pub use control::self_id;
pub use spawn::{Builder, JoinHandle, Priority, Thread, ThreadExit, spawn, spawn_detached};
pub use tls::{Destructor, TLS_KEYS_MAX, TlsKey};
