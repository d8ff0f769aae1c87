//! Per-thread cooperative scheduler
//!
//! Lazily created on first use and stored as a raw thread-local pointer; a
//! borrow-checked cell would not survive the control flow here, since a
//! context switch leaves Rust scope structure entirely.
//!
//! Suspension protocol: a task sets its wait key (deadline, optional fd),
//! enters the wait-heap, registers with epoll if fd-bound, and switches to
//! the poller. The poller resumes it when either the deadline elapses or
//! the fd reports readiness; whichever fires first removes the other's
//! entry, so no wake is ever delivered twice.

use crate::arch::context_switch;
use crate::clock;
use crate::error::TaskError;
use crate::poller;
use crate::queue::WaitQueue;
use crate::task::Task;
use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::rc::Rc;
use strand_core::{kib, mib, Arena};
use strand_core::{kdebug, ktrace};

const SCHEDULER_ARENA_MAX: usize = mib(2);
const POLLER_STACK: usize = kib(64);
const CLEANER_STACK: usize = kib(32);

pub struct Scheduler {
    /// Arena holding the poller and cleaner stacks.
    arena: Rc<Arena>,
    pub(crate) main: NonNull<Task>,
    pub(crate) poller: NonNull<Task>,
    pub(crate) cleaner: NonNull<Task>,
    pub(crate) active: NonNull<Task>,
    pub(crate) previous: NonNull<Task>,
    pub(crate) queue: WaitQueue,
    pub(crate) cancel: bool,
    /// Absolute ns deadline the poller must wake main by; `u64::MAX` when
    /// no drain is in progress.
    pub(crate) wake_deadline: u64,
    pub(crate) epoll_fd: RawFd,
    pub(crate) signal_fd: RawFd,
}

thread_local! {
    static SCHEDULER: Cell<*mut Scheduler> = const { Cell::new(std::ptr::null_mut()) };
}

/// Get this thread's scheduler, creating it on first use.
pub(crate) fn current() -> Result<NonNull<Scheduler>, TaskError> {
    let existing = SCHEDULER.with(|c| c.get());
    if let Some(ptr) = NonNull::new(existing) {
        return Ok(ptr);
    }

    let arena = Rc::new(Arena::new(kib(4), SCHEDULER_ARENA_MAX).map_err(TaskError::from)?);

    let main = Box::into_raw(Box::new(Task::main()));
    let poller_task = Task::with_stack(
        &arena,
        POLLER_STACK,
        task_entrypoint as usize,
        0,
        Some(Box::new(poller::poller_main)),
        None,
    )?;
    let cleaner_task = Task::with_stack(
        &arena,
        CLEANER_STACK,
        task_entrypoint as usize,
        0,
        Some(Box::new(cleaner_main)),
        None,
    )?;
    let poller = Box::into_raw(Box::new(poller_task));
    let cleaner = Box::into_raw(Box::new(cleaner_task));

    let (epoll_fd, signal_fd) = poller::poll_init()?;

    let sched = Box::into_raw(Box::new(Scheduler {
        arena,
        main: unsafe { NonNull::new_unchecked(main) },
        poller: unsafe { NonNull::new_unchecked(poller) },
        cleaner: unsafe { NonNull::new_unchecked(cleaner) },
        active: unsafe { NonNull::new_unchecked(main) },
        previous: unsafe { NonNull::new_unchecked(main) },
        queue: WaitQueue::new(),
        cancel: false,
        wake_deadline: u64::MAX,
        epoll_fd,
        signal_fd,
    }));

    SCHEDULER.with(|c| c.set(sched));
    kdebug!("scheduler: initialized on thread {:?}", std::thread::current().id());
    Ok(unsafe { NonNull::new_unchecked(sched) })
}

impl Scheduler {
    /// Transfer control to `task`. Returns when something switches back.
    pub(crate) fn switch_to(&mut self, task: NonNull<Task>) {
        self.previous = self.active;
        self.active = task;
        unsafe {
            context_switch(
                &mut (*self.previous.as_ptr()).ctx,
                &(*self.active.as_ptr()).ctx,
            );
        }
    }

    pub(crate) fn switch_to_poller(&mut self) {
        let poller = self.poller;
        self.switch_to(poller);
    }
}

/// First frame of every coroutine: run the entry closure, then hand the
/// finished task to the cleaner. Never returns.
extern "C" fn task_entrypoint(_arg: usize) {
    let mut sched = current().expect("scheduler exists while a task is running");
    let sched = unsafe { sched.as_mut() };
    let task = unsafe { sched.active.as_mut() };
    if let Some(entry) = task.entry.take() {
        entry();
    }
    let cleaner = sched.cleaner;
    sched.switch_to(cleaner);
    unreachable!("finished task resumed");
}

/// Cleaner loop: runs a finished task's cleanup on this stack, frees the
/// task header, and returns control to the poller.
fn cleaner_main() {
    let mut sched = current().expect("scheduler exists while the cleaner is running");
    let sched = unsafe { sched.as_mut() };
    loop {
        let finished = sched.previous;
        debug_assert!(finished != sched.poller && finished != sched.main);
        let cleanup = unsafe { (*finished.as_ptr()).cleanup.take() };
        if let Some(cleanup) = cleanup {
            cleanup();
        }
        // The task's stack lives in an arena the cleanup may have released;
        // only the heap header remains to drop.
        unsafe { drop(Box::from_raw(finished.as_ptr())) };
        sched.switch_to_poller();
    }
}

// ── Public API ───────────────────────────────────────────────────────

/// Spawn a coroutine with a stack carved from `arena`.
///
/// `entry` runs on the new stack; `cleanup` runs afterwards on the
/// cleaner's stack and is the right place to release the arena itself.
/// The task is queued with an immediate deadline and runs on this thread's
/// next pass through the poller.
pub fn spawn(
    arena: &Rc<Arena>,
    stack_size: usize,
    entry: impl FnOnce() + 'static,
    cleanup: impl FnOnce() + 'static,
) -> Result<(), TaskError> {
    let mut sched = current()?;
    let sched = unsafe { sched.as_mut() };

    let mut task = Task::with_stack(
        arena,
        stack_size,
        task_entrypoint as usize,
        0,
        Some(Box::new(entry)),
        Some(Box::new(cleanup)),
    )?;
    task.deadline = clock::now_ns();

    let task = unsafe { NonNull::new_unchecked(Box::into_raw(Box::new(task))) };
    sched.queue.add(task);
    ktrace!("scheduler: spawned task with {} byte stack", stack_size);
    Ok(())
}

/// Suspend the active task until `fd` is ready in the given direction or
/// `timeout_ms` elapses (0 waits indefinitely).
///
/// Registration is edge-triggered and one-shot: every wait re-arms the fd.
/// May resume early without either condition when the scheduler cycles;
/// callers retry their non-blocking I/O and wait again.
pub fn wait_fd(fd: RawFd, write: bool, timeout_ms: u64) -> Result<(), TaskError> {
    let mut sched = current()?;
    let sched = unsafe { sched.as_mut() };
    let mut task_ptr = sched.active;

    {
        let task = unsafe { task_ptr.as_mut() };
        task.fd = fd;
        task.write = write;
        task.deadline = if timeout_ms == 0 {
            clock::far_future()
        } else {
            clock::deadline_ms(timeout_ms)
        };
    }

    sched.queue.add(task_ptr);
    poller::poll_add(sched.epoll_fd, task_ptr)?;
    sched.switch_to_poller();

    let task = unsafe { task_ptr.as_ref() };
    if clock::now_ns() >= task.deadline {
        return Err(TaskError::Timeout);
    }
    if task_ptr == sched.main && sched.cancel {
        return Err(TaskError::Cancelled);
    }
    Ok(())
}

/// Suspend the active task for `ms` milliseconds (0 yields until the next
/// poller pass).
pub fn sleep(ms: u64) -> Result<(), TaskError> {
    let mut sched = current()?;
    let sched = unsafe { sched.as_mut() };
    let mut task_ptr = sched.active;

    {
        let task = unsafe { task_ptr.as_mut() };
        task.fd = -1;
        task.deadline = if ms == 0 {
            clock::now_ns()
        } else {
            clock::deadline_ms(ms)
        };
    }

    sched.queue.add(task_ptr);
    sched.switch_to_poller();
    Ok(())
}

/// Request process termination; delivered through the scheduler's signal
/// descriptor like an external SIGTERM.
pub fn cancel() {
    unsafe {
        libc::raise(libc::SIGTERM);
    }
}

/// True once the shutdown signal has been observed on this thread.
pub fn cancelled() -> bool {
    let existing = SCHEDULER.with(|c| c.get());
    match NonNull::new(existing) {
        Some(ptr) => unsafe { ptr.as_ref().cancel },
        None => false,
    }
}

/// Drain in-flight tasks and tear the scheduler down.
///
/// Only callable from the main task. Yields to the poller until the
/// wait-heap empties or `timeout_ms` elapses (0 drains without limit);
/// tasks still queued past the deadline are abandoned with their arenas.
pub fn shutdown(timeout_ms: u64) -> Result<(), TaskError> {
    let existing = SCHEDULER.with(|c| c.get());
    let Some(mut sched_ptr) = NonNull::new(existing) else {
        return Ok(());
    };
    let sched = unsafe { sched_ptr.as_mut() };

    if sched.active != sched.main {
        return Err(TaskError::NotMainTask);
    }

    let deadline = if timeout_ms == 0 {
        u64::MAX
    } else {
        clock::deadline_ms(timeout_ms)
    };
    sched.wake_deadline = deadline;
    while !sched.queue.is_empty() && clock::now_ns() < deadline {
        sched.switch_to_poller();
    }
    sched.wake_deadline = u64::MAX;
    if !sched.queue.is_empty() {
        kdebug!(
            "scheduler: shutdown abandoning {} queued task(s)",
            sched.queue.len()
        );
    }

    unsafe {
        libc::close(sched.epoll_fd);
        libc::close(sched.signal_fd);
    }

    SCHEDULER.with(|c| c.set(std::ptr::null_mut()));
    unsafe {
        let sched = Box::from_raw(sched_ptr.as_ptr());
        drop(Box::from_raw(sched.poller.as_ptr()));
        drop(Box::from_raw(sched.cleaner.as_ptr()));
        drop(Box::from_raw(sched.main.as_ptr()));
        drop(sched);
    }
    kdebug!("scheduler: shut down");
    Ok(())
}

/// Abandoned tasks at shutdown keep their heap headers; reclaim them so the
/// teardown above stays leak-free.
impl Drop for Scheduler {
    fn drop(&mut self) {
        while let Some(task) = self.queue.pop() {
            if task != self.main && task != self.poller && task != self.cleaner {
                unsafe { drop(Box::from_raw(task.as_ptr())) };
            }
        }
        let _ = &self.arena;
    }
}
