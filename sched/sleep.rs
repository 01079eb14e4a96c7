// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The sleep list and the per-tick wakeup sweep.
//!
//! `sleep_until` and `tick` are the two suspension/resumption points
//! that run under hard interrupt-off discipline rather than the
//! scheduler's own lock being the only guard: `sleep_until` expects
//! its caller to have already disabled interrupts (typically a timer
//! facade), and `tick` runs on the interrupt handler's own stack.

use crate::interrupt::{self, InterruptContext, InterruptsOff};
use crate::scheduler;

/// Puts the running thread to sleep until `absolute_tick`. Blocks
/// immediately and returns only once woken by a later `tick` call.
///
/// A target at or before the current tick is not special-cased: the
/// thread still blocks and is woken on the very next `tick` sweep
/// (R3) — there is no short-circuit that skips blocking, matching the
/// reference timer_sleep this is grounded on.
///
/// # Panics
///
/// Panics if interrupts are currently enabled (the caller is expected
/// to have disabled them already).
pub fn sleep_until(absolute_tick: u64) {
    let token = InterruptsOff::assert_already_off();
    let current = scheduler::current();
    current.set_tick_sleep_until(absolute_tick);
    scheduler::with_state(|inner| scheduler::push_sleep(inner, current.clone()));
    scheduler::block(&token);
}

/// Called exactly once per hardware timer tick, in interrupt context.
/// Sweeps the sleep list, waking every thread whose deadline has
/// passed (P5), and advances the running thread's time-slice counter,
/// flagging a deferred yield if the slice has expired.
///
/// # Panics
///
/// Panics if interrupts are currently enabled.
pub fn tick(now: u64) {
    let _token = InterruptsOff::assert_already_off();
    let _context = InterruptContext::enter();

    let expired = scheduler::with_state(|inner| scheduler::drain_expired_sleepers(inner, now));
    for thread in expired {
        scheduler::unblock(thread.tid());
    }

    scheduler::with_state(scheduler::tick_time_slice);
}
