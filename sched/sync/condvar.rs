// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! A condition variable: a list of per-waiter semaphores, each
//! signalled individually so `signal` can pick the highest-priority
//! waiter rather than whichever happened to enqueue first.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use spin::Mutex;

use crate::scheduler;
use crate::sync::lock::Lock;
use crate::sync::semaphore::Semaphore;
use crate::thread::Thread;

struct Waiter {
    thread: Arc<Thread>,
    sema: Arc<Semaphore>,
}

pub struct Condvar {
    waiters: Mutex<VecDeque<Waiter>>,
}

impl Condvar {
    pub fn new() -> Self {
        Condvar {
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Atomically releases `lock` and blocks until woken by a
    /// matching `signal` or `broadcast`, then reacquires `lock`
    /// before returning.
    ///
    /// # Panics
    ///
    /// Panics if the running thread does not hold `lock`.
    pub fn wait(&self, lock: &Arc<Lock>) {
        assert!(lock.held_by_current(), "sched: condvar wait without holding the lock");

        let sema = Arc::new(Semaphore::new(0));
        self.waiters.lock().push_back(Waiter {
            thread: scheduler::current(),
            sema: sema.clone(),
        });

        lock.release();
        sema.down();
        lock.acquire();
    }

    /// Wakes the highest-priority waiter, if any.
    ///
    /// # Panics
    ///
    /// Panics if the running thread does not hold `lock`.
    pub fn signal(&self, lock: &Arc<Lock>) {
        assert!(lock.held_by_current(), "sched: condvar signal without holding the lock");

        let mut waiters = self.waiters.lock();
        if waiters.is_empty() {
            return;
        }
        let index = waiters
            .iter()
            .enumerate()
            .max_by_key(|(_, w)| w.thread.priority())
            .map(|(i, _)| i)
            .expect("checked non-empty above");
        let woken = waiters.remove(index).expect("index came from this deque");
        drop(waiters);
        woken.sema.up();
    }

    /// Wakes every current waiter.
    ///
    /// # Panics
    ///
    /// Panics if the running thread does not hold `lock`.
    pub fn broadcast(&self, lock: &Arc<Lock>) {
        assert!(lock.held_by_current(), "sched: condvar broadcast without holding the lock");

        let mut waiters = self.waiters.lock();
        let drained: alloc::vec::Vec<Waiter> = waiters.drain(..).collect();
        drop(waiters);
        for w in drained {
            w.sema.up();
        }
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}
