//! Cooperative cancellation and the cleanup-handler stack.
//!
//! A cancel request only marks the target. The target acts on it at its next
//! checkpoint while `killable`: it runs its cleanup handlers innermost-first,
//! then unwinds with a [`Cancelled`] payload back to the spawn trampoline.
//!
//! Cleanup handlers live pinned in the frame of [`with_cleanup`] or
//! [`with_cleanup_run`]. The control block links them intrusively, so pushing
//! one never allocates. Callers never hold a handler, so a handler cannot be
//! leaked while linked and the list never points at dead stack frames.

#![allow(unsafe_code)]

use std::cell::Cell;
use std::marker::{PhantomData, PhantomPinned};
use std::pin::{Pin, pin};
use std::ptr;
use std::sync::atomic::Ordering;

use super::control::{self, Control};

/// Unwind payload of a cancelled thread.
///
/// Code that catches unwinds on a managed thread should resume any payload of
/// this type, or the thread keeps running after acting on its cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// One entry of a thread's cleanup stack.
pub(crate) struct CleanupHandler<'a> {
    proc: &'a (dyn Fn() + 'a),
    next: Cell<*const CleanupHandler<'static>>,
    linked: Cell<bool>,
    _pin: PhantomPinned,
}

impl<'a> CleanupHandler<'a> {
    fn new(proc: &'a (dyn Fn() + 'a)) -> Self {
        Self {
            proc,
            next: Cell::new(ptr::null()),
            linked: Cell::new(false),
            _pin: PhantomPinned,
        }
    }

    fn erased(&self) -> *const CleanupHandler<'static> {
        ptr::from_ref(self).cast()
    }
}

/// Remove `target` from the cleanup stack of `ctl`, wherever it sits.
fn unlink(ctl: &Control, target: *const CleanupHandler<'static>) {
    // SAFETY: handlers are only created pinned inside `with_cleanup*`, whose
    // scope unlinks them before the frame returns or unwinds, so every node
    // reachable from the head is alive. The list is only touched by its
    // owning thread.
    unsafe {
        let head = ctl.cleaners().load(Ordering::Relaxed);
        if ptr::eq(head, target) {
            ctl.cleaners()
                .store((*target).next.get().cast_mut(), Ordering::Relaxed);
            (*target).linked.set(false);
            return;
        }
        let mut cursor = head.cast_const();
        while !cursor.is_null() {
            let node = &*cursor;
            let next = node.next.get();
            if ptr::eq(next, target) {
                node.next.set((*target).next.get());
                (*target).linked.set(false);
                return;
            }
            cursor = next;
        }
    }
}

/// A pushed cleanup handler. Dropping the scope pops it.
struct CleanupScope<'h, 'a> {
    handler: Pin<&'h CleanupHandler<'a>>,
    // The stack belongs to the pushing thread.
    _not_send: PhantomData<*const ()>,
}

impl CleanupScope<'_, '_> {
    /// Pop the handler and run it now.
    fn run(self) {
        let handler = self.handler;
        drop(self);
        (handler.proc)();
    }
}

impl Drop for CleanupScope<'_, '_> {
    fn drop(&mut self) {
        if self.handler.linked.get()
            && let Some(ctl) = control::current()
        {
            unlink(&ctl, self.handler.erased());
        }
    }
}

/// Push `handler` onto the calling thread's cleanup stack.
///
/// On an unmanaged thread nothing is pushed and the scope is inert apart from
/// [`CleanupScope::run`].
fn push<'h, 'a>(handler: Pin<&'h CleanupHandler<'a>>) -> CleanupScope<'h, 'a> {
    if let Some(ctl) = control::current()
        && !handler.linked.get()
    {
        let cleaners = ctl.cleaners();
        handler
            .next
            .set(cleaners.load(Ordering::Relaxed).cast_const());
        handler.linked.set(true);
        cleaners.store(handler.erased().cast_mut(), Ordering::Relaxed);
    }
    CleanupScope {
        handler,
        _not_send: PhantomData,
    }
}

/// Pop the innermost cleanup handler without running it.
///
/// The handler stays popped when its `with_cleanup*` call returns, so
/// [`with_cleanup_run`] still runs its cleanup on normal return.
pub fn pop_cleanup() {
    let Some(ctl) = control::current() else {
        return;
    };
    let head = ctl.cleaners().load(Ordering::Relaxed);
    if !head.is_null() {
        unlink(&ctl, head.cast_const());
    }
}

/// Run `body` with `cleanup` pushed as a cleanup handler.
///
/// `cleanup` runs only if the thread is cancelled inside `body`. The handler
/// is popped when `body` returns or unwinds.
///
/// ```
/// use portathread_core::with_cleanup;
///
/// let n = with_cleanup(|| println!("released"), || 2 + 2);
/// assert_eq!(n, 4);
/// ```
pub fn with_cleanup<R>(cleanup: impl Fn(), body: impl FnOnce() -> R) -> R {
    let handler = pin!(CleanupHandler::new(&cleanup));
    let _scope = push(handler.as_ref());
    body()
}

/// Like [`with_cleanup`], but `cleanup` also runs after `body` returns.
///
/// On cancellation it runs once, from the checkpoint. A panic in `body` pops
/// the handler without running it.
pub fn with_cleanup_run<R>(cleanup: impl Fn(), body: impl FnOnce() -> R) -> R {
    let handler = pin!(CleanupHandler::new(&cleanup));
    let scope = push(handler.as_ref());
    let ret = body();
    scope.run();
    ret
}

/// Disable cancellation for the calling thread, returning the previous state.
///
/// Always `false` on unmanaged threads.
pub fn save_cancel() -> bool {
    control::current().is_some_and(|ctl| ctl.swap_killable(false))
}

/// Restore a state returned by [`save_cancel`].
pub fn restore_cancel(state: bool) {
    if let Some(ctl) = control::current() {
        debug_assert!(!ctl.killable(), "restore_cancel without save_cancel");
        ctl.swap_killable(state);
    }
}

/// Cancellation checkpoint.
///
/// Returns normally unless the calling thread is killable and has a pending
/// cancel request. In that case the cleanup handlers run innermost-first and
/// the thread unwinds; this function then never returns.
pub fn test_cancel() {
    let Some(ctl) = control::current() else {
        return;
    };
    if !(ctl.killable() && ctl.killed()) {
        return;
    }
    ctl.swap_killable(false);
    tracing::debug!(thread = ctl.id(), "acting on cancel request");

    let mut cursor = ctl
        .cleaners()
        .swap(ptr::null_mut(), Ordering::Relaxed)
        .cast_const();
    drop(ctl);
    while !cursor.is_null() {
        // SAFETY: detached nodes were linked a moment ago and their frames are
        // still below us on this stack.
        let handler = unsafe { &*cursor };
        cursor = handler.next.get();
        handler.linked.set(false);
        (handler.proc)();
    }
    std::panic::resume_unwind(Box::new(Cancelled));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn with_managed<R>(f: impl FnOnce(&Arc<Control>) -> R) -> R {
        let ctl = Arc::new(Control::new(false, None));
        control::enter(&ctl);
        let ret = f(&ctl);
        control::leave();
        ret
    }

    fn depth(ctl: &Control) -> usize {
        let mut n = 0;
        let mut cursor = ctl.cleaners().load(Ordering::Relaxed).cast_const();
        while !cursor.is_null() {
            n += 1;
            cursor = unsafe { (*cursor).next.get() };
        }
        n
    }

    #[test]
    fn unmanaged_thread_ignores_cancellation_api() {
        std::thread::spawn(|| {
            assert!(!save_cancel());
            restore_cancel(true);
            test_cancel();
            pop_cleanup();
            let ran = Cell::new(false);
            let mark = || ran.set(true);
            let handler = pin!(CleanupHandler::new(&mark));
            push(handler.as_ref()).run();
            assert!(ran.get());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn scopes_push_and_pop_in_order() {
        std::thread::spawn(|| {
            with_managed(|ctl| {
                let noop = || {};
                let outer = pin!(CleanupHandler::new(&noop));
                let inner = pin!(CleanupHandler::new(&noop));
                let outer_scope = push(outer.as_ref());
                assert_eq!(depth(ctl), 1);
                let inner_scope = push(inner.as_ref());
                assert_eq!(depth(ctl), 2);
                drop(inner_scope);
                assert_eq!(depth(ctl), 1);
                drop(outer_scope);
                assert_eq!(depth(ctl), 0);
            });
        })
        .join()
        .unwrap();
    }

    #[test]
    fn out_of_order_drop_unlinks_the_right_handler() {
        std::thread::spawn(|| {
            with_managed(|ctl| {
                let noop = || {};
                let a = pin!(CleanupHandler::new(&noop));
                let b = pin!(CleanupHandler::new(&noop));
                let scope_a = push(a.as_ref());
                let scope_b = push(b.as_ref());
                drop(scope_a);
                assert_eq!(depth(ctl), 1);
                assert!(ptr::eq(
                    ctl.cleaners().load(Ordering::Relaxed).cast_const(),
                    b.erased()
                ));
                drop(scope_b);
                assert_eq!(depth(ctl), 0);
            });
        })
        .join()
        .unwrap();
    }

    #[test]
    fn pop_cleanup_then_scope_drop_is_single_pop() {
        std::thread::spawn(|| {
            with_managed(|ctl| {
                let noop = || {};
                let outer = pin!(CleanupHandler::new(&noop));
                let inner = pin!(CleanupHandler::new(&noop));
                let _outer_scope = push(outer.as_ref());
                let inner_scope = push(inner.as_ref());
                pop_cleanup();
                assert_eq!(depth(ctl), 1);
                drop(inner_scope);
                assert_eq!(depth(ctl), 1);
            });
        })
        .join()
        .unwrap();
    }

    fn register_and_return(hits: &Cell<usize>) -> usize {
        with_cleanup(|| hits.set(hits.get() + 100), || 1)
    }

    #[test]
    fn returned_frame_leaves_no_handler_behind() {
        std::thread::spawn(|| {
            with_managed(|ctl| {
                let hits = Cell::new(0);
                assert_eq!(register_and_return(&hits), 1);
                assert_eq!(depth(ctl), 0);
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    with_cleanup(
                        || hits.set(hits.get() + 1),
                        || {
                            assert_eq!(register_and_return(&hits), 1);
                            assert_eq!(depth(ctl), 1);
                            ctl.swap_killable(true);
                            ctl.request_cancel();
                            test_cancel();
                        },
                    );
                }));
                assert!(result.expect_err("checkpoint must unwind").is::<Cancelled>());
                assert_eq!(hits.get(), 1);
                assert_eq!(depth(ctl), 0);
            });
        })
        .join()
        .unwrap();
    }

    #[test]
    fn unwinding_body_pops_its_handler() {
        std::thread::spawn(|| {
            with_managed(|ctl| {
                let ran = Cell::new(false);
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    with_cleanup_run::<()>(|| ran.set(true), || panic!("body failed"));
                }));
                assert!(result.is_err());
                assert!(!ran.get());
                assert_eq!(depth(ctl), 0);
            });
        })
        .join()
        .unwrap();
    }

    #[test]
    fn with_cleanup_run_runs_on_normal_return() {
        std::thread::spawn(|| {
            with_managed(|ctl| {
                let ran = Cell::new(0);
                let value = with_cleanup_run(
                    || ran.set(ran.get() + 1),
                    || {
                        assert_eq!(depth(ctl), 1);
                        9
                    },
                );
                assert_eq!(value, 9);
                assert_eq!(ran.get(), 1);
                assert_eq!(depth(ctl), 0);
            });
        })
        .join()
        .unwrap();
    }

    #[test]
    fn checkpoint_runs_handlers_innermost_first_and_unwinds() {
        std::thread::spawn(|| {
            with_managed(|ctl| {
                let order = std::cell::RefCell::new(Vec::new());
                let first = || order.borrow_mut().push(1);
                let second = || order.borrow_mut().push(2);
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let outer = pin!(CleanupHandler::new(&first));
                    let _outer = push(outer.as_ref());
                    let inner = pin!(CleanupHandler::new(&second));
                    let _inner = push(inner.as_ref());
                    ctl.swap_killable(true);
                    ctl.request_cancel();
                    test_cancel();
                }));
                let payload = result.expect_err("checkpoint must unwind");
                assert!(payload.is::<Cancelled>());
                assert_eq!(*order.borrow(), vec![2, 1]);
                assert!(!ctl.killable());
                assert_eq!(depth(ctl), 0);
            });
        })
        .join()
        .unwrap();
    }

    #[test]
    fn saved_cancel_state_defers_cancellation() {
        std::thread::spawn(|| {
            with_managed(|ctl| {
                ctl.swap_killable(true);
                ctl.request_cancel();
                let saved = save_cancel();
                assert!(saved);
                test_cancel();
                restore_cancel(saved);
                let result = std::panic::catch_unwind(test_cancel);
                assert!(result.is_err());
            });
        })
        .join()
        .unwrap();
    }

    #[test]
    fn with_cleanup_skips_handler_on_normal_return() {
        std::thread::spawn(|| {
            with_managed(|ctl| {
                let ran = Cell::new(false);
                let value = with_cleanup(|| ran.set(true), || 5);
                assert_eq!(value, 5);
                assert!(!ran.get());
                assert_eq!(depth(ctl), 0);
            });
        })
        .join()
        .unwrap();
    }

    #[test]
    fn scope_run_pops_then_runs() {
        std::thread::spawn(|| {
            with_managed(|ctl| {
                let ran = Cell::new(0);
                let bump = || ran.set(ran.get() + 1);
                let handler = pin!(CleanupHandler::new(&bump));
                let scope = push(handler.as_ref());
                scope.run();
                assert_eq!(ran.get(), 1);
                assert_eq!(depth(ctl), 0);
            });
        })
        .join()
        .unwrap();
    }
}
