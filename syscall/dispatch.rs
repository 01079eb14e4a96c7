// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Routes a trapped syscall number to the filesystem/user-memory
//! collaborators, validating every user pointer first.
//!
//! Three defects in the retrieved reference implementation are fixed
//! here rather than reproduced (see the doc comments on
//! [`Descriptors::find`], [`check_user_range`], and [`Dispatcher::read`]):
//! a null-dereferencing descriptor lookup, an inverted user-pointer
//! bounds check, and a filesystem-lock leak on the keyboard read path.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;

use sched::ThreadId;

use crate::Syscall;

/// An opaque handle to an open file, minted by [`Filesystem::open`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileHandle(pub u64);

/// The filesystem collaborator. Out of scope itself (no
/// implementation lives in this tree); the dispatcher is specified
/// only against this interface.
pub trait Filesystem: Send + Sync {
    fn open(&self, path: &str) -> Option<FileHandle>;
    fn create(&self, path: &str, initial_size: u32) -> bool;
    fn remove(&self, path: &str) -> bool;
    fn filesize(&self, file: FileHandle) -> i32;
    fn read(&self, file: FileHandle, buf: &mut [u8]) -> i32;
    fn write(&self, file: FileHandle, buf: &[u8]) -> i32;
    fn seek(&self, file: FileHandle, pos: u32);
    fn tell(&self, file: FileHandle) -> u32;
    fn close(&self, file: FileHandle);
}

/// The validated user-memory probe every multi-byte copy is built
/// from. Out of scope itself; production wiring backs it with a page
/// fault handler that distinguishes a bad user address from a real
/// fault.
pub trait UserMemory: Send + Sync {
    /// Reads one byte at `addr`, or `None` if it isn't mapped/accessible.
    fn get_user(&self, addr: usize) -> Option<u8>;
    /// Writes one byte at `addr`, returning whether it succeeded.
    fn put_user(&self, addr: usize, byte: u8) -> bool;
    /// The first address reserved for the kernel; user addresses must
    /// lie strictly below it.
    fn user_kernel_split(&self) -> usize;
}

/// A user-facing syscall failure, returned instead of panicking (§7).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyscallFault {
    /// A user pointer (or pointer+length range) was outside the
    /// user/kernel split, or a byte inside it wasn't accessible.
    BadPointer,
    /// The file descriptor doesn't name an open file for this thread.
    BadDescriptor,
    /// The syscall number isn't recognized.
    BadSyscall,
}

impl fmt::Display for SyscallFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyscallFault::BadPointer => write!(f, "bad user pointer"),
            SyscallFault::BadDescriptor => write!(f, "bad file descriptor"),
            SyscallFault::BadSyscall => write!(f, "unrecognized syscall"),
        }
    }
}

/// Per-thread file-descriptor table. Numbers start at 3 (0, 1, 2 are
/// reserved for stdin/stdout/stderr) and are assigned monotonically.
pub struct Descriptors {
    next_fd: u32,
    entries: Vec<(u32, FileHandle)>,
}

impl Descriptors {
    fn new() -> Self {
        Descriptors {
            next_fd: 3,
            entries: Vec::new(),
        }
    }

    fn insert(&mut self, handle: FileHandle) -> u32 {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.entries.push((fd, handle));
        fd
    }

    /// Looks up `fd`'s open file handle.
    ///
    /// Returns `None` on no match rather than indexing or
    /// dereferencing blindly — the retrieved reference lookup this is
    /// grounded on instead dereferenced an absent entry, a
    /// null-dereference bug fixed here by construction (`Option`
    /// threaded through every caller).
    fn find(&self, fd: u32) -> Option<FileHandle> {
        self.entries.iter().find(|(f, _)| *f == fd).map(|(_, h)| *h)
    }

    fn remove(&mut self, fd: u32) -> Option<FileHandle> {
        let index = self.entries.iter().position(|(f, _)| *f == fd)?;
        Some(self.entries.remove(index).1)
    }

    fn drain(&mut self) -> Vec<FileHandle> {
        self.entries.drain(..).map(|(_, h)| h).collect()
    }
}

/// Checks that `[addr, addr+len)` lies entirely in user space.
///
/// Rejects at or above the user/kernel split and accepts strictly
/// below it. The retrieved reference check had this polarity
/// inverted (rejecting below, accepting at/above); this is a bug
/// against the contract, fixed here rather than reproduced.
fn check_user_range(mem: &dyn UserMemory, addr: usize, len: usize) -> bool {
    match addr.checked_add(len) {
        Some(end) => addr < mem.user_kernel_split() && end <= mem.user_kernel_split(),
        None => false,
    }
}

fn copy_in(mem: &dyn UserMemory, addr: usize, len: usize) -> Option<Vec<u8>> {
    if !check_user_range(mem, addr, len) {
        return None;
    }
    let mut buf = Vec::with_capacity(len);
    for i in 0..len {
        buf.push(mem.get_user(addr + i)?);
    }
    Some(buf)
}

fn copy_out(mem: &dyn UserMemory, addr: usize, data: &[u8]) -> bool {
    if !check_user_range(mem, addr, data.len()) {
        return false;
    }
    for (i, byte) in data.iter().enumerate() {
        if !mem.put_user(addr + i, *byte) {
            return false;
        }
    }
    true
}

/// Routes numbered syscalls to the filesystem and user-memory
/// collaborators, serializing all filesystem-touching calls behind a
/// single process-wide lock (the reference implementation's
/// `filesys_lock`).
pub struct Dispatcher {
    fs: Arc<dyn Filesystem>,
    mem: Arc<dyn UserMemory>,
    fs_lock: Mutex<()>,
    tables: Mutex<BTreeMap<ThreadId, Descriptors>>,
}

impl Dispatcher {
    pub fn new(fs: Arc<dyn Filesystem>, mem: Arc<dyn UserMemory>) -> Self {
        Dispatcher {
            fs,
            mem,
            fs_lock: Mutex::new(()),
            tables: Mutex::new(BTreeMap::new()),
        }
    }

    fn descriptors_for<R>(&self, tid: ThreadId, f: impl FnOnce(&mut Descriptors) -> R) -> R {
        let mut tables = self.tables.lock();
        let descriptors = tables.entry(tid).or_insert_with(Descriptors::new);
        f(descriptors)
    }

    /// Routes a trapped syscall number to its operation (§4.5).
    ///
    /// A fault surfaced by any operation terminates the offending
    /// process with exit code -1 (§7), rather than propagating to the
    /// caller: by the time a `SyscallFault` exists the filesystem lock
    /// it might have been holding has already been released by the
    /// failing operation's own RAII guard, so `exit` is free to run.
    pub fn dispatch(&self, tid: ThreadId, number: usize, args: [usize; 3]) -> i32 {
        let terminate = |f: SyscallFault| -> i32 {
            log::warn!("syscall: thread {} faulted ({}), terminating", tid, f);
            self.exit(tid, -1);
            -1
        };

        match Syscall::from_usize(number) {
            None => terminate(SyscallFault::BadSyscall),
            Some(Syscall::Halt) => self.halt(),
            Some(Syscall::Exit) => self.exit(tid, args[0] as i32),
            Some(Syscall::Exec) => self.exec(tid, args[0]),
            Some(Syscall::Wait) => self.wait(tid, args[0] as i32),
            Some(Syscall::Create) => match self.create(args[0], args[1] as u32) {
                Ok(created) => created as i32,
                Err(fault) => terminate(fault),
            },
            Some(Syscall::Remove) => match self.remove(args[0]) {
                Ok(removed) => removed as i32,
                Err(fault) => terminate(fault),
            },
            Some(Syscall::Open) => match self.open(tid, args[0]) {
                Ok(fd) => fd,
                Err(fault) => terminate(fault),
            },
            Some(Syscall::Filesize) => match self.filesize(tid, args[0] as u32) {
                Ok(size) => size,
                Err(fault) => terminate(fault),
            },
            Some(Syscall::Read) => match self.read(tid, args[0] as u32, args[1], args[2] as u32) {
                Ok(n) => n,
                Err(fault) => terminate(fault),
            },
            Some(Syscall::Write) => match self.write(tid, args[0] as u32, args[1], args[2] as u32) {
                Ok(n) => n,
                Err(fault) => terminate(fault),
            },
            Some(Syscall::Seek) => match self.seek(tid, args[0] as u32, args[1] as u32) {
                Ok(()) => 0,
                Err(fault) => terminate(fault),
            },
            Some(Syscall::Tell) => match self.tell(tid, args[0] as u32) {
                Ok(pos) => pos as i32,
                Err(fault) => terminate(fault),
            },
            Some(Syscall::Close) => match self.close(tid, args[0] as u32) {
                Ok(()) => 0,
                Err(fault) => terminate(fault),
            },
        }
    }

    pub fn halt(&self) -> ! {
        log::info!("syscall: halt");
        panic!("sched: halt requested (shutdown device out of scope)");
    }

    /// Records the caller's exit status and terminates it.
    pub fn exit(&self, tid: ThreadId, status: i32) -> i32 {
        log::trace!("syscall: thread {} exit({})", tid, status);
        for handle in self.descriptors_for(tid, Descriptors::drain) {
            let _guard = self.fs_lock.lock();
            self.fs.close(handle);
        }
        if let Some(process) = sched::scheduler::current().process().lock().as_mut() {
            process.exit_code = Some(status);
        }
        sched::scheduler::exit();
        status
    }

    /// Unimplemented: no user-program loader collaborator exists in
    /// this crate's scope. Always faults.
    pub fn exec(&self, _tid: ThreadId, _cmdline_addr: usize) -> i32 {
        log::warn!("syscall: exec is unimplemented (no loader collaborator)");
        -1
    }

    /// Unimplemented for the same reason as `exec`.
    pub fn wait(&self, _tid: ThreadId, _pid: i32) -> i32 {
        log::warn!("syscall: wait is unimplemented (no loader collaborator)");
        -1
    }

    pub fn create(&self, path_addr: usize, initial_size: u32) -> Result<bool, SyscallFault> {
        let path = self.read_c_string(path_addr)?;
        let _guard = self.fs_lock.lock();
        Ok(self.fs.create(&path, initial_size))
    }

    pub fn remove(&self, path_addr: usize) -> Result<bool, SyscallFault> {
        let path = self.read_c_string(path_addr)?;
        let _guard = self.fs_lock.lock();
        Ok(self.fs.remove(&path))
    }

    pub fn open(&self, tid: ThreadId, path_addr: usize) -> Result<i32, SyscallFault> {
        let path = self.read_c_string(path_addr)?;
        let handle = {
            let _guard = self.fs_lock.lock();
            self.fs.open(&path)
        };
        match handle {
            Some(handle) => Ok(self.descriptors_for(tid, |d| d.insert(handle)) as i32),
            None => Ok(-1),
        }
    }

    pub fn filesize(&self, tid: ThreadId, fd: u32) -> Result<i32, SyscallFault> {
        let handle = self.descriptors_for(tid, |d| d.find(fd)).ok_or(SyscallFault::BadDescriptor)?;
        let _guard = self.fs_lock.lock();
        Ok(self.fs.filesize(handle))
    }

    /// Reads `size` bytes for `fd` into the user buffer at `buf_addr`.
    ///
    /// Acquires `fs_lock` unconditionally at entry and holds it for
    /// the whole call via an RAII guard, so every return path —
    /// including the fd-0 (keyboard) path below, which never actually
    /// touches the filesystem — releases it. The reference read this
    /// is grounded on unlocked on every path except this one; dropping
    /// the guard fixes that structurally rather than requiring a
    /// matching `unlock` call on each branch.
    pub fn read(&self, tid: ThreadId, fd: u32, buf_addr: usize, size: u32) -> Result<i32, SyscallFault> {
        let _guard = self.fs_lock.lock();

        if fd == 0 {
            // No console/keyboard collaborator is modeled; treat
            // stdin as perpetually empty rather than fabricating
            // input.
            return Ok(0);
        }
        if fd == 1 || fd == 2 {
            return Err(SyscallFault::BadDescriptor);
        }

        let handle = self.descriptors_for(tid, |d| d.find(fd)).ok_or(SyscallFault::BadDescriptor)?;
        let mut buf = alloc::vec![0u8; size as usize];
        let n = self.fs.read(handle, &mut buf);
        if n < 0 {
            return Ok(n);
        }
        if !copy_out(&*self.mem, buf_addr, &buf[..n as usize]) {
            return Err(SyscallFault::BadPointer);
        }
        Ok(n)
    }

    pub fn write(&self, tid: ThreadId, fd: u32, buf_addr: usize, size: u32) -> Result<i32, SyscallFault> {
        let data = copy_in(&*self.mem, buf_addr, size as usize).ok_or(SyscallFault::BadPointer)?;

        if fd == 1 || fd == 2 {
            // No console collaborator is modeled; route console
            // output through the same logging facade used elsewhere
            // in this tree.
            log::info!("syscall: thread {} fd{} wrote {} bytes", tid, fd, data.len());
            return Ok(data.len() as i32);
        }
        if fd == 0 {
            return Err(SyscallFault::BadDescriptor);
        }

        let handle = self.descriptors_for(tid, |d| d.find(fd)).ok_or(SyscallFault::BadDescriptor)?;
        let _guard = self.fs_lock.lock();
        Ok(self.fs.write(handle, &data))
    }

    pub fn seek(&self, tid: ThreadId, fd: u32, pos: u32) -> Result<(), SyscallFault> {
        let handle = self.descriptors_for(tid, |d| d.find(fd)).ok_or(SyscallFault::BadDescriptor)?;
        let _guard = self.fs_lock.lock();
        self.fs.seek(handle, pos);
        Ok(())
    }

    pub fn tell(&self, tid: ThreadId, fd: u32) -> Result<u32, SyscallFault> {
        let handle = self.descriptors_for(tid, |d| d.find(fd)).ok_or(SyscallFault::BadDescriptor)?;
        let _guard = self.fs_lock.lock();
        Ok(self.fs.tell(handle))
    }

    pub fn close(&self, tid: ThreadId, fd: u32) -> Result<(), SyscallFault> {
        let handle = self.descriptors_for(tid, |d| d.remove(fd)).ok_or(SyscallFault::BadDescriptor)?;
        let _guard = self.fs_lock.lock();
        self.fs.close(handle);
        Ok(())
    }

    fn read_c_string(&self, addr: usize) -> Result<alloc::string::String, SyscallFault> {
        let mut bytes = Vec::new();
        let mut offset = 0;
        loop {
            if !check_user_range(&*self.mem, addr + offset, 1) {
                return Err(SyscallFault::BadPointer);
            }
            let byte = self.mem.get_user(addr + offset).ok_or(SyscallFault::BadPointer)?;
            if byte == 0 {
                break;
            }
            bytes.push(byte);
            offset += 1;
        }
        alloc::string::String::from_utf8(bytes).map_err(|_| SyscallFault::BadPointer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeMap as StdMap;
    use alloc::string::String;

    struct FakeMemory {
        split: usize,
        bytes: Mutex<StdMap<usize, u8>>,
    }

    impl FakeMemory {
        fn new(split: usize) -> Self {
            FakeMemory {
                split,
                bytes: Mutex::new(StdMap::new()),
            }
        }

        fn write_str_at(&self, addr: usize, s: &str) {
            let mut bytes = self.bytes.lock();
            for (i, b) in s.bytes().enumerate() {
                bytes.insert(addr + i, b);
            }
            bytes.insert(addr + s.len(), 0);
        }

        fn write_bytes_at(&self, addr: usize, data: &[u8]) {
            let mut bytes = self.bytes.lock();
            for (i, b) in data.iter().enumerate() {
                bytes.insert(addr + i, *b);
            }
        }
    }

    impl UserMemory for FakeMemory {
        fn get_user(&self, addr: usize) -> Option<u8> {
            if addr >= self.split {
                return None;
            }
            Some(self.bytes.lock().get(&addr).copied().unwrap_or(0))
        }

        fn put_user(&self, addr: usize, byte: u8) -> bool {
            if addr >= self.split {
                return false;
            }
            self.bytes.lock().insert(addr, byte);
            true
        }

        fn user_kernel_split(&self) -> usize {
            self.split
        }
    }

    struct FakeFile {
        name: String,
        data: Mutex<Vec<u8>>,
        pos: Mutex<u32>,
    }

    struct FakeFilesystem {
        files: Mutex<Vec<FakeFile>>,
    }

    impl FakeFilesystem {
        fn new() -> Self {
            FakeFilesystem { files: Mutex::new(Vec::new()) }
        }
    }

    impl Filesystem for FakeFilesystem {
        fn open(&self, path: &str) -> Option<FileHandle> {
            let files = self.files.lock();
            files
                .iter()
                .position(|f| f.name == path)
                .map(|i| FileHandle(i as u64))
        }

        fn create(&self, path: &str, _initial_size: u32) -> bool {
            let mut files = self.files.lock();
            if files.iter().any(|f| f.name == path) {
                return false;
            }
            files.push(FakeFile {
                name: String::from(path),
                data: Mutex::new(Vec::new()),
                pos: Mutex::new(0),
            });
            true
        }

        fn remove(&self, _path: &str) -> bool {
            true
        }

        fn filesize(&self, file: FileHandle) -> i32 {
            self.files.lock()[file.0 as usize].data.lock().len() as i32
        }

        fn read(&self, file: FileHandle, buf: &mut [u8]) -> i32 {
            let files = self.files.lock();
            let f = &files[file.0 as usize];
            let data = f.data.lock();
            let mut pos = f.pos.lock();
            let start = *pos as usize;
            let n = buf.len().min(data.len().saturating_sub(start));
            buf[..n].copy_from_slice(&data[start..start + n]);
            *pos += n as u32;
            n as i32
        }

        fn write(&self, file: FileHandle, buf: &[u8]) -> i32 {
            let files = self.files.lock();
            let f = &files[file.0 as usize];
            let mut data = f.data.lock();
            let mut pos = f.pos.lock();
            let start = *pos as usize;
            if start + buf.len() > data.len() {
                data.resize(start + buf.len(), 0);
            }
            data[start..start + buf.len()].copy_from_slice(buf);
            *pos += buf.len() as u32;
            buf.len() as i32
        }

        fn seek(&self, file: FileHandle, pos: u32) {
            *self.files.lock()[file.0 as usize].pos.lock() = pos;
        }

        fn tell(&self, file: FileHandle) -> u32 {
            *self.files.lock()[file.0 as usize].pos.lock()
        }

        fn close(&self, _file: FileHandle) {}
    }

    fn dispatcher() -> (Dispatcher, Arc<FakeMemory>) {
        let mem = Arc::new(FakeMemory::new(0x1000));
        let d = Dispatcher::new(Arc::new(FakeFilesystem::new()), mem.clone());
        (d, mem)
    }

    #[test]
    fn find_returns_none_for_unknown_fd_instead_of_dereferencing() {
        let descriptors = Descriptors::new();
        assert_eq!(descriptors.find(42), None);
    }

    #[test]
    fn user_range_rejects_at_and_above_the_split_and_accepts_strictly_below() {
        let mem = FakeMemory::new(0x1000);
        assert!(check_user_range(&mem, 0x0ff0, 16));
        assert!(!check_user_range(&mem, 0x1000, 1), "addresses at the split are rejected");
        assert!(!check_user_range(&mem, 0x0ff8, 16), "a range crossing the split is rejected");
        assert!(!check_user_range(&mem, usize::MAX, 1), "overflowing the address space is rejected");
    }

    #[test]
    fn read_releases_the_filesystem_lock_on_the_keyboard_path() {
        let (d, _mem) = dispatcher();
        let result = d.read(ThreadId::IDLE, 0, 0x100, 8);
        assert_eq!(result, Ok(0));
        // If the keyboard path had leaked the lock, this would deadlock
        // (spin::Mutex spins forever rather than panicking).
        assert!(d.fs_lock.try_lock().is_some(), "fs_lock must not be held after read() returns");
    }

    #[test]
    fn write_and_read_round_trip_through_a_real_file() {
        let (d, mem) = dispatcher();
        let tid = ThreadId::IDLE;

        mem.write_str_at(0x100, "foo");
        assert_eq!(d.create(0x100, 0), Ok(true));

        let fd = d.open(tid, 0x100).unwrap();
        assert!(fd >= 3);

        let payload: alloc::vec::Vec<u8> = (0..128u32).map(|i| (i % 251) as u8).collect();
        mem.write_bytes_at(0x200, &payload);
        let written = d.write(tid, fd as u32, 0x200, payload.len() as u32).unwrap();
        assert_eq!(written, payload.len() as i32);
        d.close(tid, fd as u32).unwrap();

        let fd = d.open(tid, 0x100).unwrap() as u32;
        let n = d.read(tid, fd, 0x300, payload.len() as u32).unwrap();
        assert_eq!(n, payload.len() as i32);

        let read_back: alloc::vec::Vec<u8> = (0..payload.len()).map(|i| mem.get_user(0x300 + i).unwrap()).collect();
        assert_eq!(read_back, payload, "S6: written and read bytes match");
        d.close(tid, fd).unwrap();
    }

    #[test]
    fn dispatch_routes_known_syscalls_to_their_operation() {
        let (d, mem) = dispatcher();
        let tid = ThreadId::IDLE;
        mem.write_str_at(0x100, "bar");

        let created = d.dispatch(tid, Syscall::Create as i32 as usize, [0x100, 0, 0]);
        assert_eq!(created, 1, "S6: create succeeds");

        let fd = d.dispatch(tid, Syscall::Open as i32 as usize, [0x100, 0, 0]);
        assert!(fd >= 3);

        let closed = d.dispatch(tid, Syscall::Close as i32 as usize, [fd as usize, 0, 0]);
        assert_eq!(closed, 0);
    }

    struct TestPageAllocator;
    impl sched::PageAllocator for TestPageAllocator {
        fn get_page(&self) -> Option<sched::Page> {
            Some(sched::Page::zeroed())
        }
        fn free_page(&self, _page: sched::Page) {}
    }

    /// Brings up a scheduler exactly once for the whole test binary,
    /// for the one test below that exercises a syscall fault's
    /// process-termination path. This crate has no `#[cfg(test)]`
    /// scheduler doubles of its own (those live inside `sched`'s own
    /// test build, not its public surface), so the real `init`/`start`
    /// entry points are used here instead.
    fn ensure_scheduler() {
        static INIT: spin::Once<()> = spin::Once::new();
        INIT.call_once(|| {
            sched::scheduler::init(
                sched::Config::default(),
                Arc::new(TestPageAllocator),
                Arc::new(sched::hooks::NoProcessHooks),
                Arc::new(sched::NoOpContextSwitch),
            );
            sched::scheduler::start();
        });
    }

    #[test]
    fn dispatch_terminates_the_process_on_a_fault() {
        ensure_scheduler();
        let (d, _mem) = dispatcher();
        let tid = sched::scheduler::current().tid();

        // fd 5 was never opened: read() faults and the process is terminated.
        let result = d.dispatch(tid, Syscall::Read as i32 as usize, [5, 0x100, 8]);
        assert_eq!(result, -1, "§7: a syscall fault terminates the process with exit code -1");
    }
}
