use crate::{Errno, LastErrno};

/// Crate-wide result alias over [`Status`].
pub type Result<T, E = Status> = core::result::Result<T, E>;

/// Outcome space of worker and transport operations.
///
/// `Busy` and `InProgress` are continuation sentinels rather than failures:
/// `Busy` tells the caller of `arm` that events are already pending and the
/// blocking step must be skipped, `InProgress` marks an operation that
/// completes asynchronously. `NoResource` is temporary back-pressure from a
/// transport; the worker retries it internally after a progress pump and
/// never surfaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Status {
    #[error("invalid parameter")]
    InvalidParam,
    #[error("out of memory")]
    NoMemory,
    #[error("input/output error: {0}")]
    Io(Errno),
    #[error("operation not supported")]
    Unsupported,
    #[error("no such device")]
    NoDevice,
    #[error("out of transport resources")]
    NoResource,
    #[error("events already pending")]
    Busy,
    #[error("operation in progress")]
    InProgress,
}

impl From<Errno> for Status {
    fn from(errno: Errno) -> Self {
        match errno.raw() {
            libc::ENOMEM => Status::NoMemory,
            libc::EINVAL => Status::InvalidParam,
            libc::ENODEV | libc::ENOENT => Status::NoDevice,
            libc::EAGAIN => Status::NoResource,
            _ => Status::Io(errno),
        }
    }
}

impl From<LastErrno> for Status {
    fn from(LastErrno: LastErrno) -> Self {
        Errno::new().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(Status::from(Errno(libc::ENOMEM)), Status::NoMemory);
        assert_eq!(Status::from(Errno(libc::ENODEV)), Status::NoDevice);
        assert!(matches!(Status::from(Errno(libc::EPIPE)), Status::Io(_)));
    }

    #[test]
    fn io_errors_format_the_errno() {
        let msg = Status::Io(Errno(libc::EBADF)).to_string();
        assert!(msg.starts_with("input/output error"), "{msg}");
    }
}
