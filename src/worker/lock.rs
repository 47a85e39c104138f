//! The conditional worker lock: none, spinlock or blocking mutex,
//! decided once at creation.

use core::cell::{Cell, UnsafeCell};
use core::ops::{Deref, DerefMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockKind {
    None,
    Spin,
    Mutex,
}

pub(crate) enum CondLock<T> {
    /// Single-thread contract: no serialization at all. The busy flag
    /// turns accidental reentrancy or cross-thread use into a panic
    /// instead of corruption.
    Single {
        busy: Cell<bool>,
        value: UnsafeCell<T>,
    },
    Spin(spin::Mutex<T>),
    Mutex(parking_lot::Mutex<T>),
}

// Safety: the Spin and Mutex variants serialize all access. The Single
// variant is covered by the worker's single-thread contract: every locking
// operation originates from one thread, other threads only touch the
// worker's lock-free state (`signal`, counters). The busy flag is a
// best-effort tripwire for that contract, not a synchronization primitive.
unsafe impl<T: Send> Send for CondLock<T> {}
unsafe impl<T: Send> Sync for CondLock<T> {}

impl<T> CondLock<T> {
    pub fn new(kind: LockKind, value: T) -> Self {
        match kind {
            LockKind::None => CondLock::Single {
                busy: Cell::new(false),
                value: UnsafeCell::new(value),
            },
            LockKind::Spin => CondLock::Spin(spin::Mutex::new(value)),
            LockKind::Mutex => CondLock::Mutex(parking_lot::Mutex::new(value)),
        }
    }

    pub fn lock(&self) -> CondGuard<'_, T> {
        match self {
            CondLock::Single { busy, value } => {
                assert!(
                    !busy.replace(true),
                    "single-threaded worker entered reentrantly"
                );
                CondGuard::Single { busy, value }
            }
            CondLock::Spin(mutex) => CondGuard::Spin(mutex.lock()),
            CondLock::Mutex(mutex) => CondGuard::Mutex(mutex.lock()),
        }
    }
}

pub(crate) enum CondGuard<'a, T> {
    Single {
        busy: &'a Cell<bool>,
        value: &'a UnsafeCell<T>,
    },
    Spin(spin::MutexGuard<'a, T>),
    Mutex(parking_lot::MutexGuard<'a, T>),
}

impl<T> Deref for CondGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self {
            // Safety: the busy flag grants this guard exclusive access
            // under the single-thread contract.
            CondGuard::Single { value, .. } => unsafe { &*value.get() },
            CondGuard::Spin(guard) => guard,
            CondGuard::Mutex(guard) => guard,
        }
    }
}

impl<T> DerefMut for CondGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match self {
            // Safety: see Deref.
            CondGuard::Single { value, .. } => unsafe { &mut *value.get() },
            CondGuard::Spin(guard) => guard,
            CondGuard::Mutex(guard) => guard,
        }
    }
}

impl<T> Drop for CondGuard<'_, T> {
    fn drop(&mut self) {
        if let CondGuard::Single { busy, .. } = self {
            busy.set(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_kinds_guard_their_value() {
        for kind in [LockKind::None, LockKind::Spin, LockKind::Mutex] {
            let lock = CondLock::new(kind, 41);
            *lock.lock() += 1;
            assert_eq!(*lock.lock(), 42);
        }
    }

    #[test]
    #[should_panic(expected = "reentrantly")]
    fn single_mode_catches_reentrancy() {
        let lock = CondLock::new(LockKind::None, ());
        let _outer = lock.lock();
        let _inner = lock.lock();
    }
}
