// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Interrupt discipline as a compiler-checked capability.
//!
//! The scheduler's internal state (ready/sleep/all lists, thread
//! status and priority fields) is only ever mutated with interrupts
//! disabled. Rather than asserting an ambient "interrupt level" at
//! every call site, internal operations take an [`InterruptsOff`]
//! token by reference, so a caller must first go through [`InterruptsOff::disable`]
//! (or [`without_interrupts`]) to get one.

use core::sync::atomic::{AtomicBool, Ordering};

/// The real CPU primitive in a booted kernel. Unit tests run as an
/// ordinary userspace process, where executing `cli`/`sti` directly
/// would fault, so `#[cfg(test)]` swaps in a software flag that models
/// the same enable/disable/query contract.
#[cfg(not(test))]
mod backend {
    use x86_64::instructions::interrupts;

    pub fn are_enabled() -> bool {
        interrupts::are_enabled()
    }

    pub fn enable() {
        interrupts::enable();
    }

    pub fn disable() {
        interrupts::disable();
    }
}


/// Set while the timer tick handler is running. Read by
/// [`crate::scheduler::unblock`] to decide whether it may
/// synchronously yield (never while in interrupt context, see §5 of
/// the contract) or must defer to [`take_yield_on_return`].
static IN_INTERRUPT_CONTEXT: AtomicBool = AtomicBool::new(false);

/// Set by [`crate::sleep::tick`] when the running thread's time slice
/// has expired. Consumed by [`crate::scheduler::check_preemption`],
/// which a timer facade calls once the tick handler returns.
static YIELD_ON_RETURN: AtomicBool = AtomicBool::new(false);

/// Returns whether the calling code is running on behalf of a
/// hardware interrupt (in practice: the timer tick handler).
pub fn in_interrupt_context() -> bool {
    IN_INTERRUPT_CONTEXT.load(Ordering::Acquire)
}

/// Returns, and clears, the "yield on return from interrupt" flag.
pub fn take_yield_on_return() -> bool {
    YIELD_ON_RETURN.swap(false, Ordering::AcqRel)
}

pub(crate) fn set_yield_on_return() {
    YIELD_ON_RETURN.store(true, Ordering::Release);
}

/// RAII marker for the duration of interrupt-context handling.
pub(crate) struct InterruptContext;

impl InterruptContext {
    pub(crate) fn enter() -> Self {
        IN_INTERRUPT_CONTEXT.store(true, Ordering::Release);
        InterruptContext
    }
}

impl Drop for InterruptContext {
    fn drop(&mut self) {
        IN_INTERRUPT_CONTEXT.store(false, Ordering::Release);
    }
}

/// Proof that interrupts are currently disabled on this CPU.
///
/// Constructing one disables interrupts (if not already disabled);
/// dropping it restores whatever level was in effect beforehand. It
/// carries no data; its only purpose is to be threaded through
/// scheduler-internal functions as a witness.
pub struct InterruptsOff {
    was_enabled: bool,
}

impl InterruptsOff {
    /// Disables interrupts and returns a token that restores the
    /// previous level when dropped.
    ///
    /// Nesting is safe: an inner `disable()` while interrupts are
    /// already off simply produces a token that restores "disabled"
    /// on drop, matching the outer token's expectations.
    pub fn disable() -> Self {
        let was_enabled = backend::are_enabled();
        backend::disable();
        InterruptsOff { was_enabled }
    }

    /// Returns a token without touching the interrupt flag, asserting
    /// that interrupts are already disabled.
    ///
    /// # Panics
    ///
    /// Panics if interrupts are currently enabled. Used at entry
    /// points the contract says are only ever reached with interrupts
    /// already off (e.g. the timer tick handler).
    pub fn assert_already_off() -> Self {
        assert!(
            !backend::are_enabled(),
            "sched: entered with interrupts enabled, expected disabled"
        );
        InterruptsOff { was_enabled: false }
    }
}

impl Drop for InterruptsOff {
    fn drop(&mut self) {
        if self.was_enabled {
            backend::enable();
        }
    }
}

/// Disables interrupts for the duration of `f`, passing it the proof
/// token, and restores the previous level afterwards.
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce(&InterruptsOff) -> R,
{
    let token = InterruptsOff::disable();
    f(&token)
}

/// Returns whether interrupts are currently enabled on this CPU.
pub fn are_enabled() -> bool {
    backend::are_enabled()
}
