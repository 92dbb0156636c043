//! Error taxonomy.
//!
//! Recoverable conditions (`Busy`, `TimedOut`) are ordinary results. Broken
//! native primitives are not errors at all: they go through [`fatal`], which
//! aborts the process.

use std::io;

use thiserror::Error;

/// Errors surfaced by the threading layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ThreadError {
    /// Allocation failed on a create path.
    #[error("out of memory")]
    OutOfMemory,
    /// A bounded resource (threads, TLS slots) is exhausted.
    #[error("resource temporarily unavailable")]
    ResourceExhausted,
    /// The lock is held by someone else.
    #[error("resource busy")]
    Busy,
    /// A timed wait reached its deadline without being signaled.
    #[error("timed out")]
    TimedOut,
    /// Unknown priority level, stale key, or similar misuse.
    #[error("invalid argument")]
    InvalidArgument,
    /// The OS refused a privileged operation (raising priority).
    #[error("permission denied")]
    PermissionDenied,
}

impl ThreadError {
    /// POSIX errno value for this error.
    #[must_use]
    pub const fn errno(self) -> i32 {
        match self {
            Self::OutOfMemory => libc::ENOMEM,
            Self::ResourceExhausted => libc::EAGAIN,
            Self::Busy => libc::EBUSY,
            Self::TimedOut => libc::ETIMEDOUT,
            Self::InvalidArgument => libc::EINVAL,
            Self::PermissionDenied => libc::EPERM,
        }
    }

    /// Map an errno value back to the taxonomy.
    ///
    /// Unknown values collapse to `ResourceExhausted`, which is what native
    /// create paths report for anything but allocation and permission errors.
    #[must_use]
    pub const fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ENOMEM => Self::OutOfMemory,
            libc::EBUSY => Self::Busy,
            libc::ETIMEDOUT => Self::TimedOut,
            libc::EINVAL | libc::ESRCH => Self::InvalidArgument,
            libc::EPERM | libc::EACCES => Self::PermissionDenied,
            _ => Self::ResourceExhausted,
        }
    }
}

impl From<io::Error> for ThreadError {
    fn from(err: io::Error) -> Self {
        if let Some(errno) = err.raw_os_error() {
            return Self::from_errno(errno);
        }
        match err.kind() {
            io::ErrorKind::OutOfMemory => Self::OutOfMemory,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            io::ErrorKind::InvalidInput => Self::InvalidArgument,
            io::ErrorKind::TimedOut => Self::TimedOut,
            _ => Self::ResourceExhausted,
        }
    }
}

/// Abort the process after a native primitive failed in a way no contract
/// allows. Further progress would run on corrupted state.
#[cold]
pub(crate) fn fatal(what: &str) -> ! {
    tracing::error!(what, "unrecoverable threading failure, aborting");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_is_posix() {
        assert_eq!(ThreadError::OutOfMemory.errno(), libc::ENOMEM);
        assert_eq!(ThreadError::ResourceExhausted.errno(), libc::EAGAIN);
        assert_eq!(ThreadError::Busy.errno(), libc::EBUSY);
        assert_eq!(ThreadError::TimedOut.errno(), libc::ETIMEDOUT);
        assert_eq!(ThreadError::InvalidArgument.errno(), libc::EINVAL);
        assert_eq!(ThreadError::PermissionDenied.errno(), libc::EPERM);
    }

    #[test]
    fn from_errno_inverts_errno() {
        for err in [
            ThreadError::OutOfMemory,
            ThreadError::ResourceExhausted,
            ThreadError::Busy,
            ThreadError::TimedOut,
            ThreadError::InvalidArgument,
            ThreadError::PermissionDenied,
        ] {
            assert_eq!(ThreadError::from_errno(err.errno()), err);
        }
    }

    #[test]
    fn eacces_is_permission_denied() {
        assert_eq!(
            ThreadError::from_errno(libc::EACCES),
            ThreadError::PermissionDenied
        );
    }

    #[test]
    fn io_error_without_errno_uses_kind() {
        let err = io::Error::new(io::ErrorKind::OutOfMemory, "no stack");
        assert_eq!(ThreadError::from(err), ThreadError::OutOfMemory);
        let err = io::Error::other("whatever");
        assert_eq!(ThreadError::from(err), ThreadError::ResourceExhausted);
    }

    #[test]
    fn display_is_lowercase_message() {
        assert_eq!(ThreadError::Busy.to_string(), "resource busy");
        assert_eq!(ThreadError::TimedOut.to_string(), "timed out");
    }
}
