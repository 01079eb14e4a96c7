// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Synchronization primitives built on the scheduler's block/unblock
//! pair: a counting [`semaphore::Semaphore`], a non-recursive
//! [`lock::Lock`] with priority donation, and a [`condvar::Condvar`].
//!
//! None of these reuse the thread's intrusive links — a thread waits
//! on at most one primitive at a time in practice, but the scheduler's
//! `all`/`ready`/`sleep` links are reserved for those three lists
//! only, so waiter queues here are ordinary `VecDeque`s of `Arc<Thread>`.

pub mod condvar;
pub mod lock;
pub mod semaphore;

pub use condvar::Condvar;
pub use lock::Lock;
pub use semaphore::Semaphore;
