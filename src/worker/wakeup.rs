//! Wakeup: the aggregating event descriptor, arming, blocking and
//! cross-thread signaling.

use crate::stats::WorkerStats;
use crate::status::{Result, Status};
use crate::sys;
use crate::tl::WakeupEvents;
use crate::worker::{Worker, WorkerCore};

impl WorkerCore {
    /// The aggregating event descriptor, built on first use: the self-pipe
    /// read end plus every per-interface wakeup descriptor. Stable once
    /// created.
    pub(crate) fn event_fd(&mut self) -> Result<libc::c_int> {
        if let Some(epfd) = &self.wakeup.epfd {
            return Ok(epfd.fd());
        }
        let epfd = sys::EpollFd::new()?;
        epfd.add(self.wakeup.pipe.read_fd())?;
        for handle in self.wakeup.handles.iter().flatten() {
            epfd.add(handle.event_fd())?;
        }
        let fd = epfd.fd();
        log::debug!("worker: aggregating event fd {fd}");
        self.wakeup.epfd = Some(epfd);
        Ok(fd)
    }
}

impl Worker {
    /// The event descriptor applications block on. Lazily created, then
    /// cached for the worker's life.
    pub fn get_efd(&self) -> Result<libc::c_int> {
        self.core.lock().event_fd()
    }

    /// Arm every interface wakeup handle for tx-completion and rx events,
    /// then drain the self-pipe.
    ///
    /// [`Status::Busy`] means events were already pending (on a transport
    /// or as a signal byte); the caller must skip the blocking step and
    /// progress instead. Events posted before a successful arm are never
    /// silently lost: they either surface through the armed descriptor or
    /// turn the arm itself busy.
    pub fn arm(&self) -> Result<()> {
        let guard = self.core.lock();
        let mut busy = false;
        for handle in guard.wakeup.handles.iter().flatten() {
            match handle.arm(
                WakeupEvents::TX_COMPLETION | WakeupEvents::RX_AM | WakeupEvents::RX_SIGNALED_AM,
            ) {
                Ok(()) => {}
                Err(Status::Busy) => busy = true,
                Err(err) => return Err(err),
            }
        }
        if guard.wakeup.pipe.drain() {
            busy = true;
        }
        if busy {
            Err(Status::Busy)
        } else {
            Ok(())
        }
    }

    /// Arm and block until any interface or a signal wakes the worker.
    ///
    /// A busy arm means events are already there; the wait returns
    /// immediately with success.
    pub fn wait(&self) -> Result<()> {
        let epfd = self.get_efd()?;
        match self.arm() {
            Ok(()) => {}
            Err(Status::Busy) => return Ok(()),
            Err(err) => return Err(err),
        }
        let mut events =
            vec![libc::epoll_event { events: 0, u64: 0 }; self.num_tls.max(1)];
        // Block without the worker lock so signal and remote progress stay
        // possible while we sleep.
        sys::epoll_wait(epfd, &mut events)?;
        Ok(())
    }

    /// Wake a blocked [`Worker::wait`] from any thread.
    ///
    /// A full pipe (`EAGAIN`) means a signal is already pending and counts
    /// as success; any other write failure is an I/O error.
    pub fn signal(&self) -> Result<()> {
        WorkerStats::bump(&self.stats.signals);
        match sys::signal_fd(self.signal_fd) {
            Ok(()) => Ok(()),
            Err(errno) => Err(Status::Io(errno)),
        }
    }
}
