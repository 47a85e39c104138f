//! Thin wrappers over the kernel objects the worker needs: the self-pipe,
//! eventfds for transport wakeup, and the aggregating epoll set.
//!
//! Every wrapper owns its descriptor and closes it on drop. Failures are
//! reported as captured [`Errno`] values at the call site.

use crate::{Errno, LastErrno};

/// A non-blocking self-pipe.
///
/// The read end is added to the worker's aggregating event descriptor; any
/// thread wakes the waiter by writing one byte to the write end.
pub(crate) struct Pipe {
    rd: libc::c_int,
    wr: libc::c_int,
}

impl Pipe {
    pub fn new() -> Result<Self, Errno> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            return Err(LastErrno)?;
        }
        Ok(Pipe { rd: fds[0], wr: fds[1] })
    }

    pub fn read_fd(&self) -> libc::c_int {
        self.rd
    }

    pub fn write_fd(&self) -> libc::c_int {
        self.wr
    }

    /// Drain pending signal bytes until the pipe reports empty.
    ///
    /// Returns whether any byte was consumed, i.e. whether a signal had been
    /// posted since the last drain.
    pub fn drain(&self) -> bool {
        let mut any = false;
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.rd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n > 0 {
                any = true;
                continue;
            }
            // Empty (EAGAIN) or closed; either way there is nothing left.
            break;
        }
        any
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.rd);
            libc::close(self.wr);
        }
    }
}

/// Write one wakeup byte to a pipe write end.
///
/// `EAGAIN` means a previous signal is still pending in the pipe, which is
/// as good as delivering a new one.
pub(crate) fn signal_fd(fd: libc::c_int) -> Result<(), Errno> {
    let byte = 1u8;
    let n = unsafe { libc::write(fd, (&byte) as *const _ as *const libc::c_void, 1) };
    if n == 1 {
        return Ok(());
    }
    let errno = Errno::new();
    if errno.raw() == libc::EAGAIN {
        return Ok(());
    }
    Err(errno)
}

/// A non-blocking eventfd, the wakeup primitive of the loopback transport.
pub(crate) struct EventFd(libc::c_int);

impl EventFd {
    pub fn new() -> Result<Self, Errno> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(LastErrno)?;
        }
        Ok(EventFd(fd))
    }

    pub fn fd(&self) -> libc::c_int {
        self.0
    }

    /// Mark the descriptor readable.
    pub fn post(&self) {
        let one: u64 = 1;
        // A full counter (EAGAIN) already reads as "readable", nothing to do.
        let _ = unsafe {
            libc::write(self.0, (&one) as *const _ as *const libc::c_void, core::mem::size_of::<u64>())
        };
    }

    /// Reset the descriptor to non-readable.
    pub fn clear(&self) {
        let mut counter: u64 = 0;
        let _ = unsafe {
            libc::read(self.0, (&mut counter) as *mut _ as *mut libc::c_void, core::mem::size_of::<u64>())
        };
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

/// The aggregating event descriptor: a level-triggered epoll set.
pub(crate) struct EpollFd(libc::c_int);

impl EpollFd {
    pub fn new() -> Result<Self, Errno> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(LastErrno)?;
        }
        Ok(EpollFd(fd))
    }

    pub fn fd(&self) -> libc::c_int {
        self.0
    }

    /// Add a descriptor to the interest set, watching for readability.
    pub fn add(&self, fd: libc::c_int) -> Result<(), Errno> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.0, libc::EPOLL_CTL_ADD, fd, &mut event) } != 0 {
            return Err(LastErrno)?;
        }
        Ok(())
    }
}

impl Drop for EpollFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

/// Block on an epoll set until at least one event is ready.
///
/// Retries on interruption. The set is referenced by raw descriptor so the
/// caller can block without holding the worker lock that owns the set.
pub(crate) fn epoll_wait(
    epfd: libc::c_int,
    events: &mut [libc::epoll_event],
) -> Result<usize, Errno> {
    loop {
        let n = unsafe {
            libc::epoll_wait(epfd, events.as_mut_ptr(), events.len() as libc::c_int, -1)
        };
        if n >= 0 {
            return Ok(n as usize);
        }
        let errno = Errno::new();
        if errno.raw() == libc::EINTR {
            continue;
        }
        return Err(errno);
    }
}

/// CPU affinity mask handed to transport drivers for their helper threads.
///
/// An empty mask leaves placement to the scheduler.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuSet {
    bits: u64,
}

impl CpuSet {
    /// The empty mask.
    pub fn empty() -> Self {
        CpuSet::default()
    }

    /// Include `cpu` in the mask. CPUs beyond 63 are ignored.
    pub fn set(&mut self, cpu: usize) {
        if cpu < 64 {
            self.bits |= 1 << cpu;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn contains(&self, cpu: usize) -> bool {
        cpu < 64 && self.bits & (1 << cpu) != 0
    }
}

/// The `host` part of the worker's `host:pid` name.
pub(crate) fn host_name() -> String {
    let mut buf = [0 as libc::c_char; 256];
    if unsafe { libc::gethostname(buf.as_mut_ptr(), buf.len() - 1) } != 0 {
        return "localhost".into();
    }
    let cstr = unsafe { core::ffi::CStr::from_ptr(buf.as_ptr()) };
    cstr.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_signal_then_drain() {
        let pipe = Pipe::new().unwrap();
        assert!(!pipe.drain(), "fresh pipe must be empty");
        signal_fd(pipe.write_fd()).unwrap();
        signal_fd(pipe.write_fd()).unwrap();
        assert!(pipe.drain(), "two signals pending");
        assert!(!pipe.drain(), "drain must consume everything");
    }

    #[test]
    fn eventfd_post_clear() {
        let efd = EventFd::new().unwrap();
        efd.post();
        efd.clear();
        // A cleared eventfd reads as empty again.
        let mut counter: u64 = 0;
        let n = unsafe {
            libc::read(
                efd.fd(),
                (&mut counter) as *mut _ as *mut libc::c_void,
                core::mem::size_of::<u64>(),
            )
        };
        assert!(n < 0, "expected EAGAIN on a cleared eventfd");
    }

    #[test]
    fn epoll_reports_readable_pipe() {
        let pipe = Pipe::new().unwrap();
        let ep = EpollFd::new().unwrap();
        ep.add(pipe.read_fd()).unwrap();
        signal_fd(pipe.write_fd()).unwrap();
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 4];
        let n = epoll_wait(ep.fd(), &mut events).unwrap();
        assert_eq!(n, 1);
        let event_u64 = events[0].u64;
        assert_eq!(event_u64, pipe.read_fd() as u64);
    }

    #[test]
    fn cpu_set_mask() {
        let mut set = CpuSet::empty();
        assert!(set.is_empty());
        set.set(3);
        set.set(200);
        assert!(set.contains(3));
        assert!(!set.contains(200));
    }
}
