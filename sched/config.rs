// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Process-wide scheduler configuration, constructed once at
//! [`crate::scheduler::init`] time.

/// Default time slice, in ticks, given to each thread before
/// preemption (matches the reference scheduler's `TIME_SLICE`).
pub const DEFAULT_TIME_SLICE_TICKS: u32 = 4;

/// Default cap on the depth of a nested priority-donation chain.
pub const DEFAULT_DONATION_DEPTH_LIMIT: u8 = 8;

/// Default base priority assigned to a thread created without an
/// explicit one.
pub const DEFAULT_PRIORITY: u8 = 31;

/// Lowest priority, reserved for the idle thread.
pub const PRIORITY_MIN: u8 = 0;

/// Highest priority a thread may hold, donated or not.
pub const PRIORITY_MAX: u8 = 63;

/// Scheduler-wide configuration.
///
/// Constructed once and held behind the same global-lock discipline
/// as the rest of the scheduler's static state; later reads just take
/// a lock and copy the (small, `Copy`) value out.
#[derive(Copy, Clone, Debug)]
pub struct Config {
    /// Whether the multi-level-feedback-queue scheduler is selected
    /// (via the `-o mlfqs` boot flag, owned outside this crate).
    /// Stubbed: `nice`/`load_avg`/`recent_cpu` remain 0 regardless.
    pub mlfqs: bool,
    /// Ticks a thread runs before a preemption is requested.
    pub time_slice_ticks: u32,
    /// Maximum depth of a nested priority-donation walk before it is
    /// treated as a contract violation (an unexpected cycle).
    pub donation_depth_limit: u8,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mlfqs: false,
            time_slice_ticks: DEFAULT_TIME_SLICE_TICKS,
            donation_depth_limit: DEFAULT_DONATION_DEPTH_LIMIT,
        }
    }
}
