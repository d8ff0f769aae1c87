//! Task representation
//!
//! A task is a saved register context plus a stack carved from an arena.
//! The entry closure runs on the task's own stack; the cleanup closure runs
//! later on the cleaner's stack, which is what makes it safe for a cleanup
//! to release the arena holding the task's stack.

use crate::arch::{init_context, Context};
use crate::error::TaskError;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use strand_core::Arena;

/// Sentinel for "not in the wait-heap".
pub const QUEUE_REMOVED: usize = usize::MAX;

pub struct Task {
    pub ctx: Context,
    /// Absolute wake deadline in ns (see [`crate::clock`]).
    pub deadline: u64,
    /// Waited-on descriptor, -1 when the wait is timer-only.
    pub fd: RawFd,
    /// Waiting for writability rather than readability.
    pub write: bool,
    /// Own index in the wait-heap, or [`QUEUE_REMOVED`].
    pub queuepos: usize,
    pub entry: Option<Box<dyn FnOnce()>>,
    pub cleanup: Option<Box<dyn FnOnce()>>,
}

impl Task {
    /// The OS thread's original execution context. Registers are captured
    /// at the first switch away from it.
    pub fn main() -> Self {
        Self {
            ctx: Context::default(),
            deadline: 0,
            fd: -1,
            write: false,
            queuepos: QUEUE_REMOVED,
            entry: None,
            cleanup: None,
        }
    }

    /// A coroutine task with `stack_size` bytes of stack carved from
    /// `arena`. `entry_fn` is the address the trampoline calls with
    /// `entry_arg` as its argument.
    pub fn with_stack(
        arena: &Rc<Arena>,
        stack_size: usize,
        entry_fn: usize,
        entry_arg: usize,
        entry: Option<Box<dyn FnOnce()>>,
        cleanup: Option<Box<dyn FnOnce()>>,
    ) -> Result<Self, TaskError> {
        let stack = arena
            .alloc(stack_size, 16, false)
            .ok_or(TaskError::OutOfMemory)?;

        let mut ctx = Context::default();
        // Safety: the stack region is committed arena memory we own.
        unsafe {
            let stack_top = stack.as_ptr().add(stack_size);
            init_context(&mut ctx, stack_top, entry_fn, entry_arg);
        }

        Ok(Self {
            ctx,
            deadline: 0,
            fd: -1,
            write: false,
            queuepos: QUEUE_REMOVED,
            entry,
            cleanup,
        })
    }
}
