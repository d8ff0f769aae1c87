//! # strand-runtime
//!
//! Cooperative scheduler with stackful coroutines. One scheduler per OS
//! thread, created lazily on first use; tasks suspend explicitly through
//! [`wait_fd`] or [`sleep`] and are resumed by a poller coroutine that
//! multiplexes a deadline min-heap with edge-triggered one-shot epoll.
//!
//! Nothing preempts a task that fails to suspend cooperatively: a task that
//! calls a blocking libc function directly stalls its whole worker thread.
//!
//! The scheduler owns three bookkeeping tasks: `main` (the thread's original
//! stack), `poller` (readiness wait) and `cleaner` (runs a finished task's
//! cleanup on its own stack, so a cleanup may safely release the stack the
//! task was running on).

pub mod arch;
pub mod clock;
pub mod error;
pub mod scheduler;

pub(crate) mod poller;
pub(crate) mod queue;
pub(crate) mod task;

pub use error::TaskError;
pub use scheduler::{cancel, cancelled, shutdown, sleep, spawn, wait_fd};
