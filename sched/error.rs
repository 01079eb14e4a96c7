// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Error types for the fallible surfaces of the scheduler.
//!
//! Kernel contract violations (bad interrupt level, bad magic,
//! status/queue mismatch) are not represented here: they panic, since
//! they indicate a bug rather than a condition a caller can recover
//! from.

use core::fmt;

/// Failure returned by [`crate::scheduler::create`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CreateError {
    /// The page allocator collaborator had no frame to hand out.
    OutOfMemory,
}

impl fmt::Display for CreateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreateError::OutOfMemory => write!(f, "out of memory"),
        }
    }
}
