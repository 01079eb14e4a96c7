// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Nested priority donation: the walk that raises a lock holder's
//! (and, transitively, whoever *it* is waiting on) priority to match
//! a higher-priority waiter, and the recomputation that undoes it on
//! release.
//!
//! Grounded directly on the reference scheduler's own
//! `thread_donate_priority`/`thread_update_priority` pair: a bounded
//! walk up the "waiting on a lock held by" chain, capped so a
//! (contract-violating) cycle can't spin forever.

use alloc::sync::Arc;

use crate::config::Config;
use crate::interrupt::InterruptsOff;
use crate::scheduler;
use crate::thread::Thread;

/// Walks the chain of locks `waiter` is (transitively) blocked on,
/// raising each holder's priority to `waiter`'s if it's currently
/// lower, stopping once a link no longer donates or the configured
/// depth limit is reached (I4).
///
/// Runs only with interrupts disabled (`token` is the proof), matching
/// every other scheduler-internal mutation in this crate; the caller
/// (`Lock::acquire`) holds the same token across the whole acquire
/// path, per §4.3.
pub(crate) fn donate(waiter: &Arc<Thread>, config: &Config, _token: &InterruptsOff) {
    let mut current = waiter.clone();
    for _ in 0..config.donation_depth_limit {
        let lock = match current.waiting_lock() {
            Some(lock) => lock,
            None => return,
        };
        let holder = match lock.holder() {
            Some(holder) => holder,
            None => return,
        };
        if holder.priority() >= current.priority() {
            return;
        }
        holder.set_priority(current.priority());
        // If the holder is sitting on `ready_list`, its new priority
        // may put it out of order; re-home it to preserve I3.
        scheduler::reorder_ready_if_ready(&holder);
        current = holder;
    }

    // The chain is still unresolved after `donation_depth_limit`
    // steps: either a pathologically long wait-for chain or a cycle.
    // Either way it's a contract violation, not something to truncate
    // silently.
    if current.waiting_lock().is_some() {
        panic!(
            "sched: priority donation exceeded depth limit ({})",
            config.donation_depth_limit
        );
    }
}

/// Recomputes `thread`'s effective priority from its base priority
/// and the highest-priority thread currently waiting on any lock it
/// holds (I2). Called on lock release, after the releasing lock has
/// already been removed from the thread's holding set.
///
/// Runs only with interrupts disabled (`token` is the proof), matching
/// `donate` and the rest of `Lock::release`'s bookkeeping.
pub(crate) fn recompute_priority(thread: &Arc<Thread>, _token: &InterruptsOff) {
    let mut effective = thread.base_priority();
    for lock in thread.holding_locks() {
        if let Some(p) = lock.max_waiter_priority() {
            if p > effective {
                effective = p;
            }
        }
    }
    thread.set_priority(effective);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler;
    use crate::sync::Lock;
    use crate::thread::Status;

    #[test]
    fn single_level_donation_raises_holder_priority() {
        let _serial = scheduler::test_lock();
        scheduler::reset_for_test();
        scheduler::init_for_test();
        scheduler::start();

        let low = scheduler::register_blocked_for_test("low", 10);
        let high = scheduler::register_blocked_for_test("high", 40);

        let lock = Arc::new(Lock::new());
        lock.force_acquire_for_test(low.clone());

        high.set_waiting_lock(Some(lock.clone()));
        let token = InterruptsOff::disable();
        donate(&high, &Config::default(), &token);

        assert_eq!(low.priority(), 40, "S3: donation raises the holder to the waiter's priority");
    }

    #[test]
    fn nested_donation_propagates_through_chain() {
        let _serial = scheduler::test_lock();
        scheduler::reset_for_test();
        scheduler::init_for_test();
        scheduler::start();

        let a = scheduler::register_blocked_for_test("a", 10);
        let b = scheduler::register_blocked_for_test("b", 20);
        let c = scheduler::register_blocked_for_test("c", 50);

        let lock_ab = Arc::new(Lock::new());
        lock_ab.force_acquire_for_test(a.clone());
        let lock_bc = Arc::new(Lock::new());
        lock_bc.force_acquire_for_test(b.clone());

        // c waits on lock_bc (held by b), b waits on lock_ab (held by a).
        b.set_waiting_lock(Some(lock_ab));
        c.set_waiting_lock(Some(lock_bc));

        let token = InterruptsOff::disable();
        donate(&c, &Config::default(), &token);

        assert_eq!(b.priority(), 50, "S4: donation reaches the direct holder");
        assert_eq!(a.priority(), 50, "S4: donation propagates transitively through the chain");
    }

    #[test]
    #[should_panic(expected = "exceeded depth limit")]
    fn donation_chain_longer_than_limit_panics() {
        let _serial = scheduler::test_lock();
        scheduler::reset_for_test();
        scheduler::init_for_test();
        scheduler::start();

        let config = Config {
            donation_depth_limit: 2,
            ..Config::default()
        };

        // Three links (c -> lock held by b -> lock held by a -> lock
        // held by holder0), one more than the configured limit of 2.
        let holder0 = scheduler::register_blocked_for_test("holder0", 5);
        let a = scheduler::register_blocked_for_test("a", 10);
        let b = scheduler::register_blocked_for_test("b", 20);
        let c = scheduler::register_blocked_for_test("c", 50);

        let lock0 = Arc::new(Lock::new());
        lock0.force_acquire_for_test(holder0);
        let lock1 = Arc::new(Lock::new());
        lock1.force_acquire_for_test(a.clone());
        let lock2 = Arc::new(Lock::new());
        lock2.force_acquire_for_test(b.clone());

        a.set_waiting_lock(Some(lock0));
        b.set_waiting_lock(Some(lock1));
        c.set_waiting_lock(Some(lock2));

        let token = InterruptsOff::disable();
        donate(&c, &config, &token);
    }

    #[test]
    fn donation_stops_once_it_would_lower_priority() {
        let _serial = scheduler::test_lock();
        scheduler::reset_for_test();
        scheduler::init_for_test();
        scheduler::start();

        let holder = scheduler::register_blocked_for_test("holder", 60);
        let waiter = scheduler::register_blocked_for_test("waiter", 20);

        let lock = Arc::new(Lock::new());
        lock.force_acquire_for_test(holder.clone());
        waiter.set_waiting_lock(Some(lock));

        let token = InterruptsOff::disable();
        donate(&waiter, &Config::default(), &token);

        assert_eq!(holder.priority(), 60, "a higher-priority holder is left untouched");
    }

    #[test]
    fn donation_reorders_a_ready_holder_to_preserve_priority_order() {
        let _serial = scheduler::test_lock();
        scheduler::reset_for_test();
        scheduler::init_for_test();
        scheduler::start();

        // Created below the boot thread's default priority (31), so
        // both land on the ready list without preempting the caller.
        let holder_id = scheduler::create("holder", 10).unwrap();
        let mid_id = scheduler::create("mid", 20).unwrap();
        let holder = scheduler::lookup_for_test(holder_id);
        let mid = scheduler::lookup_for_test(mid_id);
        assert_eq!(holder.status(), Status::Ready);
        assert_eq!(mid.status(), Status::Ready);

        let waiter = scheduler::register_blocked_for_test("waiter", 50);
        let lock = Arc::new(Lock::new());
        lock.force_acquire_for_test(holder.clone());
        waiter.set_waiting_lock(Some(lock));

        let token = InterruptsOff::disable();
        donate(&waiter, &Config::default(), &token);
        drop(token);

        assert_eq!(holder.priority(), 50, "S3: a ready holder is still raised");
        let order: alloc::vec::Vec<crate::thread::ThreadId> =
            scheduler::with_state(|inner| inner.ready.iter().map(|t| t.tid()).collect());
        assert_eq!(
            order,
            alloc::vec![holder_id, mid_id],
            "I3: the raised holder moves ahead of a lower-priority ready thread"
        );
    }
}
