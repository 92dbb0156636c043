//! Thread creation, joining and priorities.
//!
//! Spawning follows a start gate: the child publishes its kernel TID and
//! parks; the creator applies the requested priority and then resumes it.
//! The entry function therefore always runs at its final priority.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use super::cancel::{self, Cancelled};
use super::control::{self, Control, THREAD_FINISHED};
use super::tls;
use crate::config;
use crate::error::{ThreadError, fatal};
use crate::sys::priority;
use crate::sys::wait::{self, WaitStatus};

/// Scheduling priority of a managed thread.
///
/// Levels follow the classic seven-step scale. Each maps to a fixed nice
/// value on systems with per-thread nice levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Priority(i32);

impl Priority {
    pub const IDLE: Self = Self(-15);
    pub const LOWEST: Self = Self(-2);
    pub const BELOW_NORMAL: Self = Self(-1);
    pub const NORMAL: Self = Self(0);
    pub const ABOVE_NORMAL: Self = Self(1);
    pub const HIGHEST: Self = Self(2);
    pub const TIME_CRITICAL: Self = Self(15);

    // Role aliases.
    pub const LOW: Self = Self::NORMAL;
    pub const INPUT: Self = Self::ABOVE_NORMAL;
    pub const AUDIO: Self = Self::HIGHEST;
    pub const VIDEO: Self = Self::NORMAL;
    pub const OUTPUT: Self = Self::ABOVE_NORMAL;
    pub const HIGHEST_ROLE: Self = Self::TIME_CRITICAL;

    /// Wrap a raw level. Unknown levels are rejected when applied.
    #[must_use]
    pub const fn from_level(level: i32) -> Self {
        Self(level)
    }

    #[must_use]
    pub const fn level(self) -> i32 {
        self.0
    }

    /// Nice value for this level.
    pub const fn nice(self) -> Result<i32, ThreadError> {
        match self.0 {
            -15 => Ok(19),
            -2 => Ok(10),
            -1 => Ok(5),
            0 => Ok(0),
            1 => Ok(-5),
            2 => Ok(-10),
            15 => Ok(-20),
            _ => Err(ThreadError::InvalidArgument),
        }
    }
}

/// How a thread's entry function ended.
pub enum ThreadExit<T> {
    /// The entry function returned.
    Returned(T),
    /// The thread acted on a cancel request.
    Cancelled,
    /// The entry function panicked; carries the panic payload.
    Panicked(Box<dyn Any + Send + 'static>),
}

impl<T> ThreadExit<T> {
    /// The returned value, if the thread ran to completion.
    pub fn returned(self) -> Option<T> {
        match self {
            Self::Returned(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    #[must_use]
    pub fn is_returned(&self) -> bool {
        matches!(self, Self::Returned(_))
    }
}

impl<T: fmt::Debug> fmt::Debug for ThreadExit<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Returned(value) => f.debug_tuple("Returned").field(value).finish(),
            Self::Cancelled => f.write_str("Cancelled"),
            Self::Panicked(_) => f.write_str("Panicked(..)"),
        }
    }
}

/// Handle to a managed thread. Cheap to clone; does not allow joining.
#[derive(Clone)]
pub struct Thread {
    ctl: Arc<Control>,
}

impl Thread {
    /// Crate-unique thread id, equal to what [`super::self_id`] reports on it.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.ctl.id()
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.ctl.name()
    }

    /// Request cancellation. Never blocks. The thread acts on it at its next
    /// checkpoint while cancellation is enabled; repeated requests are no-ops.
    pub fn cancel(&self) {
        tracing::debug!(thread = self.ctl.id(), "cancel requested");
        self.ctl.request_cancel();
    }

    /// Change the thread's scheduling priority.
    pub fn set_priority(&self, priority: Priority) -> Result<(), ThreadError> {
        let nice = priority.nice()?;
        if self.ctl.is_finished() {
            return Err(ThreadError::InvalidArgument);
        }
        priority::set_nice(self.ctl.tid(), nice)
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.ctl.is_finished()
    }

    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.ctl.is_detached()
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.ctl.id())
            .field("name", &self.ctl.name())
            .field("finished", &self.ctl.is_finished())
            .finish()
    }
}

type Packet<T> = Mutex<Option<ThreadExit<T>>>;

/// Owned permission to join a thread.
pub struct JoinHandle<T> {
    thread: Thread,
    packet: Arc<Packet<T>>,
    native: std::thread::JoinHandle<()>,
}

impl<T> JoinHandle<T> {
    #[must_use]
    pub fn thread(&self) -> &Thread {
        &self.thread
    }

    /// Shorthand for `self.thread().cancel()`.
    pub fn cancel(&self) {
        self.thread.cancel();
    }

    /// Wait for the thread to finish and collect its exit.
    ///
    /// Cancellation checkpoint for the caller.
    pub fn join(self) -> ThreadExit<T> {
        let ctl = &self.thread.ctl;
        loop {
            cancel::test_cancel();
            match wait::wait_alertable(ctl.state_word(), |s| *s == THREAD_FINISHED, None) {
                WaitStatus::Ready => break,
                WaitStatus::Alerted | WaitStatus::TimedOut => {}
            }
        }
        if self.native.join().is_err() {
            fatal("managed thread died outside its trampoline");
        }
        tracing::debug!(thread = ctl.id(), "joined thread");
        match self.packet.lock().take() {
            Some(exit) => exit,
            None => fatal("finished thread left no exit status"),
        }
    }

    /// Give up the right to join. The thread reclaims its own resources
    /// when it finishes.
    pub fn detach(self) -> Thread {
        self.thread.ctl.set_detached();
        tracing::debug!(thread = self.thread.ctl.id(), "detached thread");
        self.thread
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("thread", &self.thread)
            .finish_non_exhaustive()
    }
}

/// Thread factory.
#[derive(Debug, Clone, Default)]
pub struct Builder {
    name: Option<String>,
    stack_size: Option<usize>,
    priority: Priority,
}

impl Builder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Native stack size; defaults to the configured size.
    #[must_use]
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Start a joinable thread running `entry`.
    pub fn spawn<F, T>(self, entry: F) -> Result<JoinHandle<T>, ThreadError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (thread, packet, native) = self.launch(false, entry)?;
        Ok(JoinHandle {
            thread,
            packet,
            native,
        })
    }

    /// Start a detached thread running `entry`.
    pub fn spawn_detached<F>(self, entry: F) -> Result<Thread, ThreadError>
    where
        F: FnOnce() + Send + 'static,
    {
        let (thread, _packet, _native) = self.launch(true, entry)?;
        Ok(thread)
    }

    fn launch<F, T>(
        self,
        detached: bool,
        entry: F,
    ) -> Result<(Thread, Arc<Packet<T>>, std::thread::JoinHandle<()>), ThreadError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let nice = self.priority.nice()?;
        let config = config::runtime_config();
        let ctl = Arc::new(Control::new(detached, self.name.clone()));
        let packet: Arc<Packet<T>> = Arc::new(Mutex::new(None));

        let mut native = std::thread::Builder::new()
            .stack_size(self.stack_size.unwrap_or(config.stack_size));
        if let Some(name) = self.name {
            native = native.name(name);
        }
        let native = {
            let ctl = Arc::clone(&ctl);
            let packet = Arc::clone(&packet);
            native.spawn(move || trampoline(ctl, packet, entry))
        }
        .map_err(|err| {
            tracing::warn!(error = %err, "native thread creation failed");
            ThreadError::from(err)
        })?;

        ctl.wait_started();
        if self.priority != Priority::NORMAL
            && config.priority_policy.applies()
            && let Err(err) = priority::set_nice(ctl.tid(), nice)
        {
            tracing::warn!(
                thread = ctl.id(),
                priority = self.priority.level(),
                error = %err,
                "could not apply thread priority"
            );
        }
        ctl.resume();
        tracing::debug!(thread = ctl.id(), detached, "spawned thread");
        Ok((Thread { ctl }, packet, native))
    }
}

/// Start a joinable thread at `priority`.
pub fn spawn<F, T>(entry: F, priority: Priority) -> Result<JoinHandle<T>, ThreadError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Builder::new().priority(priority).spawn(entry)
}

/// Start a detached thread at `priority`.
pub fn spawn_detached<F>(entry: F, priority: Priority) -> Result<Thread, ThreadError>
where
    F: FnOnce() + Send + 'static,
{
    Builder::new().priority(priority).spawn_detached(entry)
}

/// Marks the thread finished even if the exit path itself unwinds.
struct FinishOnDrop(Arc<Control>);

impl Drop for FinishOnDrop {
    fn drop(&mut self) {
        control::leave();
        self.0.finish();
    }
}

fn trampoline<F, T>(ctl: Arc<Control>, packet: Arc<Packet<T>>, entry: F)
where
    F: FnOnce() -> T,
{
    control::enter(&ctl);
    let finish = FinishOnDrop(Arc::clone(&ctl));
    ctl.announce_started(priority::current_tid());
    ctl.wait_resumed();
    ctl.swap_killable(true);

    let exit = match panic::catch_unwind(AssertUnwindSafe(entry)) {
        Ok(value) => ThreadExit::Returned(value),
        Err(payload) if payload.is::<Cancelled>() => {
            tracing::debug!(thread = ctl.id(), "thread cancelled");
            ThreadExit::Cancelled
        }
        Err(payload) => {
            tracing::error!(thread = ctl.id(), "thread entry panicked");
            ThreadExit::Panicked(payload)
        }
    };
    ctl.swap_killable(false);
    *packet.lock() = Some(exit);

    tls::run_thread_destructors();
    tracing::trace!(thread = ctl.id(), "thread exiting");
    drop(finish);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn priority_levels_map_to_nice_values() {
        assert_eq!(Priority::IDLE.nice(), Ok(19));
        assert_eq!(Priority::LOWEST.nice(), Ok(10));
        assert_eq!(Priority::BELOW_NORMAL.nice(), Ok(5));
        assert_eq!(Priority::NORMAL.nice(), Ok(0));
        assert_eq!(Priority::ABOVE_NORMAL.nice(), Ok(-5));
        assert_eq!(Priority::HIGHEST.nice(), Ok(-10));
        assert_eq!(Priority::TIME_CRITICAL.nice(), Ok(-20));
        assert_eq!(
            Priority::from_level(3).nice(),
            Err(ThreadError::InvalidArgument)
        );
    }

    #[test]
    fn role_aliases() {
        assert_eq!(Priority::LOW, Priority::NORMAL);
        assert_eq!(Priority::INPUT, Priority::ABOVE_NORMAL);
        assert_eq!(Priority::AUDIO, Priority::HIGHEST);
        assert_eq!(Priority::VIDEO, Priority::NORMAL);
        assert_eq!(Priority::OUTPUT, Priority::ABOVE_NORMAL);
        assert_eq!(Priority::HIGHEST_ROLE, Priority::TIME_CRITICAL);
        assert_eq!(Priority::default(), Priority::NORMAL);
    }

    #[test]
    fn spawn_and_join_returns_value() {
        let handle = spawn(|| 6 * 7, Priority::NORMAL).unwrap();
        let exit = handle.join();
        assert!(exit.is_returned());
        assert_eq!(exit.returned(), Some(42));
    }

    #[test]
    fn managed_thread_sees_its_own_id() {
        let handle = spawn(super::super::self_id, Priority::NORMAL).unwrap();
        let id = handle.thread().id();
        assert_eq!(handle.join().returned(), Some(id));
    }

    #[test]
    fn invalid_priority_is_rejected_before_spawning() {
        let err = spawn(|| (), Priority::from_level(99)).unwrap_err();
        assert_eq!(err, ThreadError::InvalidArgument);
    }

    #[test]
    fn lowering_priority_is_always_allowed() {
        let handle = spawn(|| (), Priority::LOWEST).unwrap();
        assert!(handle.join().is_returned());
    }

    #[test]
    fn panicking_entry_is_reported() {
        let handle = Builder::new()
            .name("boom")
            .spawn(|| -> u32 { panic!("boom") })
            .unwrap();
        assert_eq!(handle.thread().name(), Some("boom"));
        assert!(matches!(handle.join(), ThreadExit::Panicked(_)));
    }

    #[test]
    fn set_priority_on_finished_thread_is_invalid() {
        let handle = spawn(|| (), Priority::NORMAL).unwrap();
        let thread = handle.thread().clone();
        handle.join();
        assert!(thread.is_finished());
        assert_eq!(
            thread.set_priority(Priority::LOWEST),
            Err(ThreadError::InvalidArgument)
        );
    }

    #[test]
    fn detached_thread_runs_to_completion() {
        let done = Arc::new(AtomicBool::new(false));
        let thread = {
            let done = Arc::clone(&done);
            spawn_detached(move || done.store(true, Ordering::SeqCst), Priority::NORMAL)
                .unwrap()
        };
        assert!(thread.is_detached());
        while !thread.is_finished() {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn detach_after_spawn() {
        let handle = spawn(|| (), Priority::NORMAL).unwrap();
        let thread = handle.detach();
        assert!(thread.is_detached());
        while !thread.is_finished() {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn custom_stack_size() {
        let handle = Builder::new()
            .stack_size(256 * 1024)
            .spawn(|| [0u8; 64 * 1024].len())
            .unwrap();
        assert_eq!(handle.join().returned(), Some(64 * 1024));
    }
}
