// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Per-thread state, identity, and queue linkage.
//!
//! Each [`Thread`] carries three intrusive link fields — one for the
//! all-threads registry, one for whichever scheduling or waiter list
//! it currently sits on (it is never on more than one of these at a
//! time, see I5 in the data model), and one for the sleep list — so
//! it can move between lists without any of them taking ownership.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use intrusive_collections::{intrusive_adapter, KeyAdapter, LinkedListAtomicLink, RBTreeAtomicLink};
use spin::Mutex;

use crate::hooks::Page;
use crate::sync::lock::Lock;

/// Sentinel written into every live [`Thread`] and checked on key
/// transitions to detect stack overflow clobbering the record.
pub const THREAD_MAGIC: u32 = 0xcd6a_bf4b;

/// Maximum length of a thread's [`Name`], in bytes.
pub const NAME_CAPACITY: usize = 16;

/// Identifies a thread, unique for the lifetime of the scheduler.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    /// The identity reserved for the idle thread.
    pub const IDLE: ThreadId = ThreadId(0);

    pub(crate) const fn new(id: u64) -> Self {
        ThreadId(id)
    }
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadId({})", self.0)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A thread's priority, in `0..=63`; higher runs first.
pub type Priority = u8;

/// A short, fixed-capacity thread name.
#[derive(Copy, Clone)]
pub struct Name {
    bytes: [u8; NAME_CAPACITY],
    len: u8,
}

impl Name {
    pub fn new(s: &str) -> Self {
        let mut bytes = [0u8; NAME_CAPACITY];
        let truncated = &s.as_bytes()[..s.len().min(NAME_CAPACITY)];
        bytes[..truncated.len()].copy_from_slice(truncated);
        Name {
            bytes,
            len: truncated.len() as u8,
        }
    }

    pub fn as_str(&self) -> &str {
        // Construction only ever copies from a valid `&str`, so the
        // retained prefix is valid UTF-8.
        core::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

/// A thread's lifecycle state (data model §3, I1).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Status {
    Running = 0,
    Ready = 1,
    Blocked = 2,
    Dying = 3,
}

impl Status {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Status::Running,
            1 => Status::Ready,
            2 => Status::Blocked,
            3 => Status::Dying,
            _ => unreachable!("invalid thread status byte"),
        }
    }
}

/// Per-process bookkeeping for threads hosting a user program.
///
/// Opaque to the scheduler: nothing in `scheduler`, `sleep`, or
/// `donation` reads these fields. The `syscall` crate populates and
/// reads them for EXEC/WAIT/file-descriptor handling.
pub struct ProcessContext {
    pub pid: u64,
    pub parent: Option<ThreadId>,
    pub exit_code: Option<i32>,
    pub next_fd: u32,
}

impl ProcessContext {
    pub fn new(pid: u64, parent: Option<ThreadId>) -> Self {
        ProcessContext {
            pid,
            parent,
            exit_code: None,
            next_fd: 3,
        }
    }
}

/// A kernel thread: identity, scheduling state, and queue linkage.
///
/// Backed by a page-sized allocation in a booted kernel (see
/// [`crate::hooks::PageAllocator`]); in this crate the record itself
/// is an ordinary heap allocation, and `current_thread()` is tracked
/// by the scheduler via an explicit pointer rather than by rounding
/// the stack pointer down to a page boundary.
pub struct Thread {
    tid: ThreadId,
    name: Name,
    status: AtomicU8,
    base_priority: AtomicU8,
    priority: AtomicU8,
    waiting_lock: Mutex<Option<Arc<Lock>>>,
    holding_locks: Mutex<Vec<Arc<Lock>>>,
    tick_sleep_until: AtomicU64,
    magic: u32,
    process: Mutex<Option<ProcessContext>>,
    // The page backing this thread's record and stack, given back to
    // the allocator by whichever thread runs next after this one
    // dies (never by this thread itself — see data model §3).
    page: Mutex<Option<Page>>,
    // Touched only by the context-switch primitive, under the
    // scheduler's own lock and with interrupts disabled.
    stack_pointer: UnsafeCell<u64>,

    pub(crate) all_link: RBTreeAtomicLink,
    pub(crate) ready_link: LinkedListAtomicLink,
    pub(crate) sleep_link: LinkedListAtomicLink,
}

// `stack_pointer` is only ever read or written from the context-switch
// path, which runs with interrupts disabled and the scheduler lock
// held, so concurrent access never happens despite `UnsafeCell` not
// being `Sync`.
unsafe impl Sync for Thread {}

impl Thread {
    pub(crate) fn new(tid: ThreadId, name: Name, priority: Priority, page: Option<Page>) -> Arc<Thread> {
        Arc::new(Thread {
            tid,
            name,
            status: AtomicU8::new(Status::Blocked as u8),
            base_priority: AtomicU8::new(priority),
            priority: AtomicU8::new(priority),
            waiting_lock: Mutex::new(None),
            holding_locks: Mutex::new(Vec::new()),
            tick_sleep_until: AtomicU64::new(0),
            magic: THREAD_MAGIC,
            process: Mutex::new(None),
            page: Mutex::new(page),
            stack_pointer: UnsafeCell::new(0),
            all_link: RBTreeAtomicLink::new(),
            ready_link: LinkedListAtomicLink::new(),
            sleep_link: LinkedListAtomicLink::new(),
        })
    }

    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: Status) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn base_priority(&self) -> Priority {
        self.base_priority.load(Ordering::Acquire)
    }

    pub(crate) fn set_base_priority(&self, p: Priority) {
        self.base_priority.store(p, Ordering::Release);
    }

    pub fn priority(&self) -> Priority {
        self.priority.load(Ordering::Acquire)
    }

    pub(crate) fn set_priority(&self, p: Priority) {
        self.priority.store(p, Ordering::Release);
    }

    /// Whether this thread currently holds an active donation (I2).
    pub fn is_donated(&self) -> bool {
        self.priority() > self.base_priority()
    }

    pub fn tick_sleep_until(&self) -> u64 {
        self.tick_sleep_until.load(Ordering::Acquire)
    }

    pub(crate) fn set_tick_sleep_until(&self, tick: u64) {
        self.tick_sleep_until.store(tick, Ordering::Release);
    }

    pub(crate) fn waiting_lock(&self) -> Option<Arc<Lock>> {
        self.waiting_lock.lock().clone()
    }

    pub(crate) fn set_waiting_lock(&self, lock: Option<Arc<Lock>>) {
        *self.waiting_lock.lock() = lock;
    }

    pub(crate) fn holding_locks(&self) -> Vec<Arc<Lock>> {
        self.holding_locks.lock().clone()
    }

    pub(crate) fn add_holding_lock(&self, lock: Arc<Lock>) {
        self.holding_locks.lock().push(lock);
    }

    pub(crate) fn remove_holding_lock(&self, lock: &Arc<Lock>) {
        self.holding_locks.lock().retain(|l| !Arc::ptr_eq(l, lock));
    }

    pub fn process(&self) -> &Mutex<Option<ProcessContext>> {
        &self.process
    }

    /// Takes the page backing this thread, leaving `None` behind.
    /// Called by the scheduler when freeing a `Dying` predecessor.
    pub(crate) fn take_page(&self) -> Option<Page> {
        self.page.lock().take()
    }

    pub(crate) fn stack_pointer(&self) -> *mut u64 {
        self.stack_pointer.get()
    }

    /// Panics if this thread's magic sentinel has been clobbered
    /// (I6): a stack overflow.
    pub fn check_magic(&self) {
        assert_eq!(
            self.magic, THREAD_MAGIC,
            "sched: thread {} stack overflow (bad magic)",
            self.tid
        );
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("name", &self.name)
            .field("status", &self.status())
            .field("base_priority", &self.base_priority())
            .field("priority", &self.priority())
            .finish()
    }
}

intrusive_adapter!(pub(crate) AllAdapter = Arc<Thread>: Thread { all_link: RBTreeAtomicLink });
intrusive_adapter!(pub(crate) ReadyAdapter = Arc<Thread>: Thread { ready_link: LinkedListAtomicLink });
intrusive_adapter!(pub(crate) SleepAdapter = Arc<Thread>: Thread { sleep_link: LinkedListAtomicLink });

impl<'a> KeyAdapter<'a> for AllAdapter {
    type Key = ThreadId;
    fn get_key(&self, thread: &'a Thread) -> ThreadId {
        thread.tid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_truncates_to_capacity() {
        let n = Name::new("a-name-that-is-much-longer-than-sixteen-bytes");
        assert_eq!(n.as_str().len(), NAME_CAPACITY);
    }

    #[test]
    fn name_roundtrip_short() {
        let n = Name::new("idle");
        assert_eq!(n.as_str(), "idle");
    }

    #[test]
    fn fresh_thread_has_no_donation() {
        let t = Thread::new(ThreadId::new(1), Name::new("a"), 31, None);
        assert_eq!(t.priority(), t.base_priority());
        assert!(!t.is_donated());
    }

    #[test]
    fn check_magic_passes_for_live_thread() {
        let t = Thread::new(ThreadId::new(1), Name::new("a"), 31, None);
        t.check_magic();
    }
}
