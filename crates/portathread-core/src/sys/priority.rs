//! Native thread identifiers and scheduling priority.
//!
//! On Linux a thread's priority is its per-thread nice value, addressed by
//! kernel TID. Lowering priority is always permitted; raising it needs
//! `CAP_SYS_NICE` (or a permissive `RLIMIT_NICE`) and otherwise fails with
//! `PermissionDenied`.

#![allow(unsafe_code)]

use crate::error::ThreadError;

/// Kernel TID of the calling thread (0 where the OS has no such notion).
#[must_use]
pub(crate) fn current_tid() -> i32 {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: gettid takes no arguments and cannot fail.
        unsafe { libc::syscall(libc::SYS_gettid) as i32 }
    }
    #[cfg(not(target_os = "linux"))]
    {
        0
    }
}

/// Set the nice value of thread `tid`.
pub(crate) fn set_nice(tid: i32, nice: i32) -> Result<(), ThreadError> {
    #[cfg(target_os = "linux")]
    {
        if tid <= 0 {
            return Err(ThreadError::InvalidArgument);
        }
        // SAFETY: setpriority only reads its scalar arguments.
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, tid as libc::id_t, nice) };
        if rc == 0 {
            Ok(())
        } else {
            Err(ThreadError::from(std::io::Error::last_os_error()))
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = tid;
        if nice == 0 {
            Ok(())
        } else {
            Err(ThreadError::PermissionDenied)
        }
    }
}

/// Current nice value of thread `tid`, if it can be read.
#[cfg(all(test, target_os = "linux"))]
#[must_use]
pub(crate) fn nice_of(tid: i32) -> Option<i32> {
    // getpriority legitimately returns -1, so errno has to be cleared first.
    // SAFETY: __errno_location returns the calling thread's errno slot.
    unsafe { *libc::__errno_location() = 0 };
    // SAFETY: getpriority only reads its scalar arguments.
    let nice = unsafe { libc::getpriority(libc::PRIO_PROCESS, tid as libc::id_t) };
    // SAFETY: as above.
    let errno = unsafe { *libc::__errno_location() };
    (errno == 0).then_some(nice)
}
