//! Scheduler error types

use std::fmt;
use strand_core::ArenaError;

/// Errors surfaced by the scheduler to suspended tasks and spawners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    /// The wait deadline elapsed before the fd became ready.
    Timeout,
    /// The process was asked to shut down; only reported to the main task.
    Cancelled,
    /// Stack or bookkeeping allocation failed.
    OutOfMemory,
    /// The operation is only valid on the main task.
    NotMainTask,
    /// An OS call failed with the given errno.
    Os(i32),
}

impl TaskError {
    /// Last-OS-error constructor for syscall failure paths.
    pub fn last_os() -> Self {
        TaskError::Os(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Timeout => write!(f, "task: wait timed out"),
            TaskError::Cancelled => write!(f, "task: cancelled by shutdown signal"),
            TaskError::OutOfMemory => write!(f, "task: allocation failed"),
            TaskError::NotMainTask => write!(f, "task: operation requires the main task"),
            TaskError::Os(errno) => {
                write!(f, "task: os error: {}", std::io::Error::from_raw_os_error(*errno))
            }
        }
    }
}

impl std::error::Error for TaskError {}

impl From<ArenaError> for TaskError {
    fn from(_: ArenaError) -> Self {
        TaskError::OutOfMemory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_arena_error() {
        let e: TaskError = ArenaError::OutOfMemory.into();
        assert_eq!(e, TaskError::OutOfMemory);
    }

    #[test]
    fn test_display() {
        assert!(TaskError::Timeout.to_string().contains("timed out"));
        assert!(TaskError::Os(libc::EBADF).to_string().contains("os error"));
    }
}
