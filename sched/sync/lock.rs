// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! A non-recursive mutual-exclusion lock with priority donation
//! (§4.3): acquiring a held lock donates the waiter's priority up the
//! chain of holders; releasing recomputes the former holder's
//! priority from whatever it still holds.

use alloc::sync::Arc;

use spin::Mutex;

use crate::donation;
use crate::interrupt::InterruptsOff;
use crate::scheduler;
use crate::sync::semaphore::Semaphore;
use crate::thread::{Priority, Thread};

pub struct Lock {
    holder: Mutex<Option<Arc<Thread>>>,
    sema: Semaphore,
}

impl Lock {
    pub fn new() -> Self {
        Lock {
            holder: Mutex::new(None),
            sema: Semaphore::new(1),
        }
    }

    pub(crate) fn holder(&self) -> Option<Arc<Thread>> {
        self.holder.lock().clone()
    }

    pub(crate) fn max_waiter_priority(&self) -> Option<Priority> {
        self.sema.max_waiter_priority()
    }

    /// Whether the running thread holds this lock.
    pub fn held_by_current(&self) -> bool {
        match self.holder() {
            Some(h) => h.tid() == scheduler::current().tid(),
            None => false,
        }
    }

    /// Acquires the lock, blocking if it is already held.
    ///
    /// If the lock is contended, donates the running thread's
    /// priority to the current holder (and transitively up whatever
    /// the holder is itself waiting on) before blocking, per I4.
    ///
    /// Disables interrupts for the whole acquire path (§4.3 step 1),
    /// restoring them only once the holder bookkeeping below is done
    /// (step 4) — the nested `InterruptsOff` taken by `self.sema.down()`
    /// while blocked composes safely with this outer one.
    ///
    /// # Panics
    ///
    /// Panics if the running thread already holds this lock (locks
    /// here are non-recursive, matching the reference lock).
    pub fn acquire(self: &Arc<Self>) {
        assert!(!self.held_by_current(), "sched: recursive lock acquire");
        let token = InterruptsOff::disable();
        let current = scheduler::current();

        if self.holder().is_some() {
            current.set_waiting_lock(Some(self.clone()));
            donation::donate(&current, &scheduler::config(), &token);
        }

        self.sema.down();

        current.set_waiting_lock(None);
        *self.holder.lock() = Some(current.clone());
        current.add_holding_lock(self.clone());
    }

    /// Releases the lock, recomputing the releasing thread's
    /// priority from its base priority and any locks it still holds
    /// (R1).
    ///
    /// Disables interrupts for the whole release path (§4.3 steps 1-5).
    ///
    /// # Panics
    ///
    /// Panics if the running thread does not hold this lock.
    pub fn release(self: &Arc<Self>) {
        assert!(self.held_by_current(), "sched: release of lock not held by current thread");
        let token = InterruptsOff::disable();
        let current = scheduler::current();

        *self.holder.lock() = None;
        current.remove_holding_lock(self);
        donation::recompute_priority(&current, &token);

        self.sema.up();
    }

    /// Installs `thread` as the holder directly, bypassing the
    /// semaphore. Used only by donation tests that exercise the
    /// donation walk in isolation from a real blocking acquire.
    #[cfg(test)]
    pub(crate) fn force_acquire_for_test(&self, thread: Arc<Thread>) {
        *self.holder.lock() = Some(thread);
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}
