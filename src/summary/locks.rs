//! The two summary mutexes, wrapped so they can only be taken in order.
//!
//! The io lock serializes load, save, check and sync. The state lock guards
//! the record list and uid index. Whenever both are needed the io lock is
//! taken first: the state guard is reachable either directly (state only)
//! or from an [`IoGuard`], and debug builds assert that this thread holds
//! no state guard of the same instance when its io lock is requested.
//!
//! Record reference counts need no lock of their own; they are the atomic
//! counts of the `Arc` handles.

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, PoisonError};

thread_local! {
    /// Addresses of the [`OrderedLocks`] whose state lock this thread holds.
    static HELD_STATE: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

pub(crate) struct OrderedLocks<T> {
    io: Mutex<()>,
    state: Mutex<T>,
}

impl<T> OrderedLocks<T> {
    pub(crate) fn new(state: T) -> Self {
        Self {
            io: Mutex::new(()),
            state: Mutex::new(state),
        }
    }

    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    /// Take the io lock. Must not be called with a state guard of `self` alive.
    pub(crate) fn io(&self) -> IoGuard<'_, T> {
        debug_assert!(
            !HELD_STATE.with(|held| held.borrow().contains(&self.addr())),
            "io lock requested while holding the summary state lock"
        );
        IoGuard {
            locks: self,
            _io: self.io.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Take only the state lock.
    pub(crate) fn state(&self) -> StateGuard<'_, T> {
        let guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let owner = self.addr();
        HELD_STATE.with(|held| held.borrow_mut().push(owner));
        StateGuard { guard, owner }
    }
}

pub(crate) struct IoGuard<'a, T> {
    locks: &'a OrderedLocks<T>,
    _io: MutexGuard<'a, ()>,
}

impl<'a, T> IoGuard<'a, T> {
    /// Take the state lock while holding the io lock.
    pub(crate) fn state(&self) -> StateGuard<'a, T> {
        self.locks.state()
    }
}

pub(crate) struct StateGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    owner: usize,
}

impl<T> Drop for StateGuard<'_, T> {
    fn drop(&mut self) {
        HELD_STATE.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|&a| a == self.owner) {
                held.swap_remove(pos);
            }
        });
    }
}

impl<T> Deref for StateGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for StateGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
