//! Re-entrant pool arbitration.
//!
//! Each pool is guarded by a mutex, a condition variable and an owning-thread
//! slot. Entry points claim ownership through [`OwnerLock::acquire`]; a
//! nested claim by the owning thread is a no-op, so internal paths may call
//! each other without deadlocking. The outermost guard clears the slot on
//! drop and wakes one waiter.
//!
//! No nesting counter is kept: inner claims simply ride on the outer one,
//! and only the guard that set the slot releases it.

use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

/// Mutex + condvar + owner slot implementing re-entrant thread ownership.
pub(crate) struct OwnerLock {
    owner: Mutex<Option<ThreadId>>,
    unlocked: Condvar,
}

impl OwnerLock {
    pub(crate) const fn new() -> Self {
        Self {
            owner: Mutex::new(None),
            unlocked: Condvar::new(),
        }
    }

    /// Block until this thread owns the lock.
    ///
    /// Returns a guard that releases ownership when the *outermost* claim of
    /// this thread goes out of scope.
    pub(crate) fn acquire(&self) -> OwnerGuard<'_> {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        loop {
            match *owner {
                None => {
                    *owner = Some(me);
                    return OwnerGuard { lock: self, release_on_drop: true };
                }
                Some(current) if current == me => {
                    // Re-entry: ride on the outer claim.
                    return OwnerGuard { lock: self, release_on_drop: false };
                }
                Some(_) => self.unlocked.wait(&mut owner),
            }
        }
    }
}

/// RAII claim on an [`OwnerLock`].
pub(crate) struct OwnerGuard<'a> {
    lock: &'a OwnerLock,
    release_on_drop: bool,
}

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        if !self.release_on_drop {
            return;
        }
        let mut owner = self.lock.owner.lock();
        debug_assert_eq!(
            *owner,
            Some(thread::current().id()),
            "owner slot mutated while held"
        );
        *owner = None;
        drop(owner);
        self.lock.unlocked.notify_one();
    }
}
