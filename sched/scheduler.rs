// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The ready queue, context switch bookkeeping, preemption, and the
//! idle thread.
//!
//! This crate never runs a real thread body or switches a real
//! register/stack state: it tracks *which* thread is logically
//! running and *in what order* others are eligible to run, and calls
//! out to [`ContextSwitch`] at the point a booted kernel would
//! actually transfer control. That keeps every operation here plain,
//! host-testable Rust.

use alloc::sync::Arc;
use alloc::vec::Vec;

use intrusive_collections::{LinkedList, RBTree};
use lazy_static::lazy_static;
use spin::Mutex;

use crate::config::Config;
use crate::error::CreateError;
use crate::hooks::{NoProcessHooks, PageAllocator, ProcessHooks};
use crate::interrupt::{self, InterruptsOff};
use crate::thread::{AllAdapter, Name, Priority, ReadyAdapter, SleepAdapter, Status, Thread, ThreadId};

/// Tid reserved for the thread that called [`init`] (the "boot
/// thread" — whatever was executing before the scheduler existed).
const BOOT_TID: u64 = 1;

/// Hook invoked at the point a real context switch would transfer
/// control to `incoming`. A booted kernel implements this with the
/// same kind of assembly trampoline as the rest of this tree's
/// context-switch primitive; tests use [`NoOpContextSwitch`], since
/// this crate only verifies scheduling bookkeeping, not a register
/// transfer.
pub trait ContextSwitch: Send + Sync {
    fn switch(&self, outgoing: ThreadId, incoming: ThreadId);
}

/// A [`ContextSwitch`] that does nothing, for tests and for kernel
/// threads that never actually need a distinct stack (none do, in
/// this crate's scope).
pub struct NoOpContextSwitch;

impl ContextSwitch for NoOpContextSwitch {
    fn switch(&self, _outgoing: ThreadId, _incoming: ThreadId) {}
}

struct Inner {
    ready: LinkedList<ReadyAdapter>,
    sleep: LinkedList<SleepAdapter>,
    all: RBTree<AllAdapter>,
    current: Option<Arc<Thread>>,
    idle: Option<Arc<Thread>>,
    next_tid: u64,
    thread_ticks: u32,
    config: Config,
    started: bool,
    page_alloc: Arc<dyn PageAllocator>,
    hooks: Arc<dyn ProcessHooks>,
    context_switch: Arc<dyn ContextSwitch>,
}

/// An unlimited page allocator, for tests that don't care about page
/// exhaustion (most of them): every `get_page` hands back a fresh
/// zeroed page, matching [`crate::hooks::Page::zeroed`].
struct UnlimitedPageAllocator;
impl PageAllocator for UnlimitedPageAllocator {
    fn get_page(&self) -> Option<crate::hooks::Page> {
        Some(crate::hooks::Page::zeroed())
    }
    fn free_page(&self, _page: crate::hooks::Page) {}
}

lazy_static! {
    static ref STATE: Mutex<Option<Inner>> = Mutex::new(None);
}

/// Initialises the scheduler, turning the calling code into the boot
/// thread. Must be called exactly once, before [`start`] or any other
/// entry point in this crate.
///
/// Returns the boot thread's id.
///
/// # Panics
///
/// Panics if called more than once.
pub fn init(
    config: Config,
    page_alloc: Arc<dyn PageAllocator>,
    hooks: Arc<dyn ProcessHooks>,
    context_switch: Arc<dyn ContextSwitch>,
) -> ThreadId {
    let mut guard = STATE.lock();
    assert!(guard.is_none(), "sched: init called twice");

    let boot = Thread::new(ThreadId::new(BOOT_TID), Name::new("main"), crate::config::DEFAULT_PRIORITY, None);
    boot.set_status(Status::Running);

    let mut all = RBTree::new(AllAdapter::new());
    all.insert(boot.clone());

    *guard = Some(Inner {
        ready: LinkedList::new(ReadyAdapter::new()),
        sleep: LinkedList::new(SleepAdapter::new()),
        all,
        current: Some(boot.clone()),
        idle: None,
        next_tid: BOOT_TID,
        thread_ticks: 0,
        config,
        started: false,
        page_alloc,
        hooks,
        context_switch,
    });

    log::info!("sched: initialised, boot thread {}", boot.tid());
    boot.tid()
}

/// Initialises the scheduler with no-op collaborators, for tests that
/// only care about scheduling bookkeeping.
#[cfg(test)]
pub(crate) fn init_for_test() -> ThreadId {
    init(
        Config::default(),
        Arc::new(UnlimitedPageAllocator),
        Arc::new(NoProcessHooks),
        Arc::new(NoOpContextSwitch),
    )
}

/// Tears down global scheduler state, for test isolation.
#[cfg(test)]
pub(crate) fn reset_for_test() {
    *STATE.lock() = None;
}

/// Registers a new, `Blocked` thread in the all-threads registry
/// without touching the ready list, for tests that want a thread
/// already parked on some waiter queue rather than driven there
/// through a real `down`/`wait` call.
#[cfg(test)]
pub(crate) fn register_blocked_for_test(name: &str, priority: Priority) -> Arc<Thread> {
    with_inner(|inner| {
        inner.next_tid += 1;
        let tid = ThreadId::new(inner.next_tid);
        let thread = Thread::new(tid, Name::new(name), priority, None);
        inner.all.insert(thread.clone());
        thread
    })
}

/// Looks up a thread registered via [`create`] or [`register_blocked_for_test`]
/// by id, for tests that need to inspect or mutate it directly.
#[cfg(test)]
pub(crate) fn lookup_for_test(tid: ThreadId) -> Arc<Thread> {
    with_inner(|inner| find(inner, tid))
}

/// Serializes tests that touch global scheduler state; `cargo test`
/// runs tests concurrently by default, but this crate has exactly one
/// scheduler singleton.
#[cfg(test)]
pub(crate) fn test_lock() -> spin::MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock()
}

fn with_inner<R>(f: impl FnOnce(&mut Inner) -> R) -> R {
    let mut guard = STATE.lock();
    let inner = guard.as_mut().expect("sched: scheduler not initialised");
    f(inner)
}

/// Creates the idle thread and marks the scheduler as owning the flow
/// of execution. Threads created before this point are not run until
/// `start` has been called.
pub fn start() {
    with_inner(|inner| {
        assert!(!inner.started, "sched: start called twice");
        let idle = Thread::new(ThreadId::IDLE, Name::new("idle"), crate::config::PRIORITY_MIN, None);
        inner.idle = Some(idle);
        inner.started = true;
    });
    log::info!("sched: started");
}

/// Returns whether [`start`] has been called.
pub fn ready() -> bool {
    with_inner(|inner| inner.started)
}

/// Returns the currently running thread.
pub fn current() -> Arc<Thread> {
    with_inner(|inner| inner.current.clone().expect("sched: no current thread"))
}

/// Returns the thread's current effective priority ([`Thread::priority`]).
pub fn get_priority() -> Priority {
    current().priority()
}

/// Returns a copy of the scheduler-wide configuration (donation depth
/// limit, time slice length, mlfqs flag).
pub(crate) fn config() -> Config {
    with_inner(|inner| inner.config)
}

/// Inserts `thread` into the ready list at the position that
/// preserves I3 (descending priority, FIFO among ties).
fn ready_insert_ordered(ready: &mut LinkedList<ReadyAdapter>, thread: Arc<Thread>) {
    let priority = thread.priority();
    let mut cursor = ready.front_mut();
    while let Some(head) = cursor.get() {
        if head.priority() < priority {
            break;
        }
        cursor.move_next();
    }
    cursor.insert_before(thread);
}

/// Re-homes `thread` in the ready list to preserve I3, if it is
/// currently on it. A no-op for a thread that is not `Ready` (donation
/// may raise the priority of a `Blocked` or `Running` holder, neither
/// of which sits on `ready`).
///
/// Called by the donation engine after raising a holder's priority
/// (§4.4): a higher priority means the holder may now belong earlier
/// in the list than its old position.
pub(crate) fn reorder_ready_if_ready(thread: &Arc<Thread>) {
    with_inner(|inner| {
        if thread.status() != Status::Ready {
            return;
        }
        let mut remaining = LinkedList::new(ReadyAdapter::new());
        while let Some(t) = inner.ready.pop_front() {
            if !Arc::ptr_eq(&t, thread) {
                remaining.push_back(t);
            }
        }
        inner.ready = remaining;
        ready_insert_ordered(&mut inner.ready, thread.clone());
    });
}

/// Allocates a thread record, backed by a fresh page from the
/// configured [`PageAllocator`], and makes it ready to run.
///
/// Per S1, if the new thread outranks the caller, it preempts
/// immediately: `create` does not return to the lower-priority caller
/// until the new thread has run (this falls out of `unblock`'s
/// ordinary preemption check, since `create` never runs in interrupt
/// context).
pub fn create(name: &str, priority: Priority) -> Result<ThreadId, CreateError> {
    let page_alloc = with_inner(|inner| inner.page_alloc.clone());
    let page = page_alloc.get_page().ok_or(CreateError::OutOfMemory)?;

    let tid = interrupt::without_interrupts(|_token| {
        with_inner(|inner| {
            inner.next_tid += 1;
            let tid = ThreadId::new(inner.next_tid);
            let thread = Thread::new(tid, Name::new(name), priority, Some(page));
            inner.all.insert(thread);
            tid
        })
    });

    log::debug!("sched: created thread {} {:?} priority {}", tid, name, priority);
    unblock(tid);
    Ok(tid)
}

/// Finds a thread by id in the all-threads registry.
fn find(inner: &Inner, tid: ThreadId) -> Arc<Thread> {
    inner
        .all
        .find(&tid)
        .get()
        .cloned()
        .unwrap_or_else(|| panic!("sched: unknown thread {}", tid))
}

/// Moves `tid` from `Blocked` to `Ready` and inserts it into the
/// ready list. Callable from interrupt context (§5); never yields
/// itself. Outside interrupt context it follows up with an immediate
/// preemption check, the same one [`set_priority`] uses.
pub fn unblock(tid: ThreadId) {
    let token = InterruptsOff::disable();
    with_inner(|inner| {
        let thread = find(inner, tid);
        assert_eq!(
            thread.status(),
            Status::Blocked,
            "sched: unblock of thread {} not in Blocked state",
            tid
        );
        thread.set_status(Status::Ready);
        ready_insert_ordered(&mut inner.ready, thread);
    });

    if !interrupt::in_interrupt_context() {
        maybe_preempt(&token);
    }
}

/// If the ready list's head now outranks the running thread (and the
/// running thread isn't idle), synchronously yields to it.
fn maybe_preempt(token: &InterruptsOff) {
    let should_yield = with_inner(|inner| {
        let current = inner.current.as_ref().expect("sched: no current thread");
        let idle_tid = inner.idle.as_ref().map(|i| i.tid());
        if Some(current.tid()) == idle_tid {
            return false;
        }
        match inner.ready.front().get() {
            Some(head) => head.priority() > current.priority(),
            None => false,
        }
    });
    if should_yield {
        yield_now_locked(token);
    }
}

/// Called by a timer facade once the tick handler ([`crate::sleep::tick`])
/// has returned, to act on the "yield on return from interrupt" flag
/// it may have set.
pub fn check_preemption() {
    if interrupt::take_yield_on_return() {
        yield_now();
    }
}

/// Re-inserts the running thread into the ready list (unless it is
/// idle) and switches to the next ready thread.
pub fn yield_now() {
    let token = InterruptsOff::disable();
    yield_now_locked(&token);
}

fn yield_now_locked(token: &InterruptsOff) {
    with_inner(|inner| {
        let current = inner.current.clone().expect("sched: no current thread");
        let idle_tid = inner.idle.as_ref().map(|i| i.tid());
        if Some(current.tid()) != idle_tid {
            current.set_status(Status::Ready);
            ready_insert_ordered(&mut inner.ready, current);
        }
    });
    schedule(token);
}

/// Blocks the running thread (caller must already have arranged for
/// it to be woken by some future `unblock`) and switches away.
pub fn block(token: &InterruptsOff) {
    with_inner(|inner| {
        let current = inner.current.as_ref().expect("sched: no current thread");
        current.set_status(Status::Blocked);
    });
    schedule(token);
}

/// Terminates the running thread.
///
/// In a booted kernel this never returns: the thread's stack (and the
/// record living at its base) is freed by whoever runs next, so there
/// is nothing to return to. This crate never performs a real stack
/// switch (see [`ContextSwitch`]), so `schedule` here returns control
/// to the caller in the ordinary way; production wiring built on a
/// real `ContextSwitch` never actually resumes this call.
///
/// # Panics
///
/// Panics if called from interrupt context.
pub fn exit() {
    assert!(
        !interrupt::in_interrupt_context(),
        "sched: exit called from interrupt context"
    );
    let token = InterruptsOff::disable();
    let current = current();
    let hooks = with_inner(|inner| inner.hooks.clone());
    hooks.process_exit(current.tid());

    with_inner(|inner| {
        let mut cursor = inner.all.find_mut(&current.tid());
        cursor.remove();
    });
    current.set_status(Status::Dying);
    log::debug!("sched: thread {} exiting", current.tid());

    schedule(&token);
}

/// Picks the next thread to run and switches to it.
///
/// Must be called only with interrupts disabled, and only after the
/// caller has already moved the current thread out of `Running`
/// (`yield_now`, `block`, and `exit` all do this before calling in).
pub(crate) fn schedule(_token: &InterruptsOff) {
    let (old, next, freed_page, hooks, context_switch);
    {
        let mut guard = STATE.lock();
        let inner = guard.as_mut().expect("sched: scheduler not initialised");

        old = inner.current.take();
        next = inner
            .ready
            .pop_front()
            .unwrap_or_else(|| inner.idle.clone().expect("sched: idle thread missing, call start() first"));

        next.set_status(Status::Running);
        inner.current = Some(next.clone());
        inner.thread_ticks = 0;

        freed_page = match &old {
            Some(o) if o.status() == Status::Dying && o.tid() != ThreadId::new(BOOT_TID) => o.take_page(),
            _ => None,
        };
        hooks = inner.hooks.clone();
        context_switch = inner.context_switch.clone();
    }

    if let Some(page) = freed_page {
        with_inner(|inner| inner.page_alloc.free_page(page));
    }
    hooks.process_activate(next.tid());
    context_switch.switch(old.map(|o| o.tid()).unwrap_or(ThreadId::IDLE), next.tid());
}

/// Sets the running thread's base priority.
///
/// If no donation is currently active, the effective priority changes
/// too (R2). If this drops the thread below the head of the ready
/// list, it yields immediately.
pub fn set_priority(p: Priority) {
    let token = InterruptsOff::disable();
    let current = current();
    let had_no_donation = !current.is_donated();
    current.set_base_priority(p);
    if had_no_donation {
        current.set_priority(p);
    }
    maybe_preempt(&token);
}

/// Increments the tick counter since the last yield; called only by
/// [`crate::sleep::tick`], which already holds interrupt context.
pub(crate) fn tick_time_slice(inner: &mut Inner) {
    inner.thread_ticks += 1;
    if inner.thread_ticks >= inner.config.time_slice_ticks {
        interrupt::set_yield_on_return();
    }
}

pub(crate) fn with_state<R>(f: impl FnOnce(&mut Inner) -> R) -> R {
    with_inner(f)
}

/// Appends `thread` to the (unordered) sleep list. Order here only
/// matters in that it fixes the traversal order `drain_expired_sleepers`
/// uses to resolve same-tick wakeups, which is what §4.2 means by
/// "list traversal order".
pub(crate) fn push_sleep(inner: &mut Inner, thread: Arc<Thread>) {
    inner.sleep.push_back(thread);
}

/// Removes and returns every sleeping thread whose deadline has
/// passed, in the order they were inserted.
pub(crate) fn drain_expired_sleepers(inner: &mut Inner, now: u64) -> Vec<Arc<Thread>> {
    let mut expired = Vec::new();
    let mut cursor = inner.sleep.front_mut();
    while cursor.get().is_some() {
        let due = cursor.get().expect("checked above").tick_sleep_until() <= now;
        if due {
            let thread = cursor.remove().expect("cursor was positioned on a live entry");
            expired.push(thread);
        } else {
            cursor.move_next();
        }
    }
    expired
}
