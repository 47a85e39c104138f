//! The asynchronous-progress context, thread mode.
//!
//! Owns one helper thread parked on a condvar. Transports post events from
//! their own threads through an [`AsyncNotifier`] (cloned into every
//! interface at open time); the thread records them in the *missed* flag,
//! which the next `progress` call consumes to re-drain. The block guard
//! serializes sections that must not race async callbacks (reply-endpoint
//! creation).

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::{Condvar, Mutex};

struct Shared {
    stop: AtomicBool,
    missed: AtomicBool,
    block: Mutex<()>,
    park: Mutex<bool>,
    cond: Condvar,
}

impl Shared {
    fn wake(&self) {
        let mut pending = self.park.lock();
        *pending = true;
        self.cond.notify_one();
    }
}

/// Handle transports use to report events posted outside the progress
/// loop, e.g. from a completion thread they own.
///
/// Cloned into every interface when it is opened. A notifier whose worker
/// is already gone posts into the void, which keeps transport threads safe
/// across worker teardown.
#[derive(Clone)]
pub struct AsyncNotifier {
    shared: Weak<Shared>,
}

impl AsyncNotifier {
    /// A notifier bound to no worker; posting through it does nothing.
    /// Lets a transport be driven outside a worker, e.g. in driver tests.
    pub fn disconnected() -> Self {
        AsyncNotifier {
            shared: Weak::new(),
        }
    }

    /// Record an event posted outside the progress loop; the next progress
    /// pass on the owning worker re-drains its interfaces.
    pub fn notify(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.wake();
        }
    }
}

pub(crate) struct AsyncContext {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl AsyncContext {
    pub fn new(worker_name: &str) -> Self {
        let shared = Arc::new(Shared {
            stop: AtomicBool::new(false),
            missed: AtomicBool::new(false),
            block: Mutex::new(()),
            park: Mutex::new(false),
            cond: Condvar::new(),
        });

        let thread_shared = shared.clone();
        let thread = thread::Builder::new()
            .name(format!("fabriq-async/{worker_name}"))
            .spawn(move || run(thread_shared))
            .ok();
        if thread.is_none() {
            log::warn!("async context: could not spawn progress thread");
        }

        AsyncContext { shared, thread }
    }

    /// Hold off async callbacks for the guard's lifetime.
    pub fn block(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.shared.block.lock()
    }

    /// The handle handed to transports at interface-open time.
    pub fn notifier(&self) -> AsyncNotifier {
        AsyncNotifier {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Consume the missed-event flag.
    pub fn take_missed(&self) -> bool {
        self.shared.missed.swap(false, Ordering::AcqRel)
    }

    /// Stop and join the helper thread. Idempotent; also run on drop.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wake();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for AsyncContext {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: Arc<Shared>) {
    loop {
        {
            let mut pending = shared.park.lock();
            while !*pending {
                shared.cond.wait(&mut pending);
            }
            *pending = false;
        }
        if shared.stop.load(Ordering::Acquire) {
            return;
        }
        // An event arrived while the application was not progressing; the
        // block guard keeps us out of guarded sections.
        let _guard = shared.block.lock();
        shared.missed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_sets_missed() {
        let mut ctx = AsyncContext::new("test");
        let notifier = ctx.notifier();
        assert!(!ctx.take_missed());
        notifier.notify();
        // The helper thread records the event; give it a moment.
        let mut seen = false;
        for _ in 0..500 {
            if ctx.take_missed() {
                seen = true;
                break;
            }
            thread::sleep(std::time::Duration::from_millis(2));
        }
        assert!(seen, "missed flag must be raised after notify");
        ctx.stop();
    }

    #[test]
    fn dead_or_disconnected_notifier_is_a_no_op() {
        AsyncNotifier::disconnected().notify();
        let orphan = {
            let ctx = AsyncContext::new("gone");
            ctx.notifier()
        };
        orphan.notify();
    }

    #[test]
    fn stop_is_idempotent() {
        let mut ctx = AsyncContext::new("test");
        ctx.stop();
        ctx.stop();
    }
}
