// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the kernel's thread scheduler and synchronization
//! primitives: a priority-preemptive ready queue, a tick-driven sleep
//! queue, and locks/semaphores/condition variables with priority
//! donation to avoid priority inversion.
//!
//! This crate owns no hardware; the page allocator, timer device, and
//! user-program subsystem are modelled as collaborator traits in
//! [`hooks`] so the scheduler core can be exercised without them.

#![no_std]

extern crate alloc;

pub mod config;
pub mod donation;
pub mod error;
pub mod hooks;
pub mod interrupt;
pub mod scheduler;
pub mod sleep;
pub mod sync;
pub mod thread;

pub use config::Config;
pub use error::CreateError;
pub use hooks::{Page, PageAllocator, ProcessHooks, TimerDevice};
pub use interrupt::InterruptsOff;
pub use scheduler::{ContextSwitch, NoOpContextSwitch};
pub use sync::{Condvar, Lock, Semaphore};
pub use thread::{Priority, Status, Thread, ThreadId};
