// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The numbered system-call surface a trapped user program dispatches
//! through, and the dispatcher that routes each number to a
//! filesystem/user-memory collaborator.

#![no_std]

extern crate alloc;

pub mod dispatch;

pub use dispatch::{Descriptors, Dispatcher, FileHandle, Filesystem, SyscallFault, UserMemory};

/// A syscall number, as read off the user stack at trap entry.
///
/// Numbering follows the reference implementation's own
/// `syscall-nr.h` (grounded in `original_source/`), rather than
/// renumbering for this rewrite — user programs linked against that
/// ABI keep working unmodified.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum Syscall {
    Halt = 0,
    Exit = 1,
    Exec = 2,
    Wait = 3,
    Create = 4,
    Remove = 5,
    Open = 6,
    Filesize = 7,
    Read = 8,
    Write = 9,
    Seek = 10,
    Tell = 11,
    Close = 12,
}

impl Syscall {
    /// Returns the syscall with the given numerical value, or `None`
    /// if it isn't recognized.
    pub fn from_usize(num: usize) -> Option<Self> {
        match num {
            0 => Some(Self::Halt),
            1 => Some(Self::Exit),
            2 => Some(Self::Exec),
            3 => Some(Self::Wait),
            4 => Some(Self::Create),
            5 => Some(Self::Remove),
            6 => Some(Self::Open),
            7 => Some(Self::Filesize),
            8 => Some(Self::Read),
            9 => Some(Self::Write),
            10 => Some(Self::Seek),
            11 => Some(Self::Tell),
            12 => Some(Self::Close),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_numerical_conversion() {
        let calls = [
            Syscall::Halt,
            Syscall::Exit,
            Syscall::Exec,
            Syscall::Wait,
            Syscall::Create,
            Syscall::Remove,
            Syscall::Open,
            Syscall::Filesize,
            Syscall::Read,
            Syscall::Write,
            Syscall::Seek,
            Syscall::Tell,
            Syscall::Close,
        ];

        for call in calls.iter().copied() {
            assert_eq!(Some(call), Syscall::from_usize(call as i32 as usize));
        }

        assert_eq!(Syscall::from_usize(999), None);
    }
}
