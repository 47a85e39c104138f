//! A unified *worker* abstraction over heterogeneous transport interfaces.
//!
//! The [`worker::Worker`] multiplexes send/receive endpoints over every
//! transport resource selected at [`Context`](context::Context) creation,
//! dispatches incoming active messages to the handlers of the installed
//! [`am::AmTable`], selects the resources carrying one-sided atomic
//! operations, and aggregates per-interface wakeup descriptors plus an
//! internal self-pipe into a single event descriptor an application thread
//! can block on.
//!
//! Transport drivers plug in through the [`tl`] contract; the crate ships a
//! loopback driver for in-process traffic. The core never interprets a
//! transport's address bytes, they are length-prefixed opaque blobs.

/// Active-message identifiers, dispatch table and descriptor ownership.
pub mod am;
mod async_ctx;
mod atomic;
mod config;
mod context;
mod pool;
mod stats;
mod status;
pub(crate) mod sys;
/// Transport-driver contract (and the loopback reference driver).
pub mod tl;
/// The worker: lifecycle, progress, wakeup, endpoints.
pub mod worker;

pub use crate::async_ctx::AsyncNotifier;
pub use crate::config::{AtomicMode, ContextConfig, ThreadMode, WorkerParams};
pub use crate::context::Context;
pub use crate::pool::RequestHandle;
pub use crate::status::{Result, Status};
pub use crate::sys::CpuSet;
pub use crate::worker::{EpConfigIndex, EpHandle, Worker, WorkerAddress};

pub(crate) struct LastErrno;

/// A captured `errno` value from a failed kernel interaction.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Errno(libc::c_int);

impl From<LastErrno> for Errno {
    fn from(LastErrno: LastErrno) -> Self {
        Errno::new()
    }
}

impl Errno {
    pub(crate) fn new() -> Self {
        Errno(unsafe { *libc::__errno_location() })
    }

    /// The raw `errno` value.
    pub fn raw(&self) -> libc::c_int {
        self.0
    }
}

impl core::fmt::Display for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let st = unsafe { libc::strerror(self.0) };
        let cstr = unsafe { core::ffi::CStr::from_ptr(st) };
        write!(f, "{}", cstr.to_string_lossy())
    }
}

impl core::fmt::Debug for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Errno({}: {})", self.0, self)
    }
}
