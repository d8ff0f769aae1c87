//! Error taxonomy for the HTTP stack.
//!
//! `Malformed` maps to a 400 response with `Connection: close`; everything
//! else tears the connection down or, for handler errors, produces a 500
//! while keeping the connection alive.

use std::error::Error;
use std::fmt;
use strand_core::ArenaError;
use strand_runtime::TaskError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpError {
    /// Input violated the grammar or a framing rule.
    Malformed,
    /// A per-connection or per-phase memory ceiling was hit.
    OutOfMemory,
    /// Socket-level failure, carrying the errno.
    Io(i32),
    /// Peer was silent past the inactivity timeout.
    Timeout,
    /// Shutdown was requested while waiting.
    Cancelled,
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpError::Malformed => write!(f, "malformed HTTP input"),
            HttpError::OutOfMemory => write!(f, "connection memory ceiling reached"),
            HttpError::Io(errno) => write!(f, "socket error (errno {errno})"),
            HttpError::Timeout => write!(f, "inactivity timeout"),
            HttpError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl Error for HttpError {}

impl From<ArenaError> for HttpError {
    fn from(_: ArenaError) -> Self {
        HttpError::OutOfMemory
    }
}

impl From<TaskError> for HttpError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Timeout => HttpError::Timeout,
            TaskError::Cancelled => HttpError::Cancelled,
            TaskError::OutOfMemory => HttpError::OutOfMemory,
            TaskError::Os(errno) => HttpError::Io(errno),
            TaskError::NotMainTask => HttpError::Io(libc::EINVAL),
        }
    }
}

/// Failures surfaced by [`crate::serve`] before or after connections run.
#[derive(Debug)]
pub enum ServerError {
    /// Host/port did not resolve or the listener could not be set up.
    Listen(String),
    /// Options failed validation.
    InvalidOptions(String),
    /// Scheduler setup or teardown failed on a worker.
    Runtime(TaskError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Listen(msg) => write!(f, "listen failed: {msg}"),
            ServerError::InvalidOptions(msg) => write!(f, "invalid options: {msg}"),
            ServerError::Runtime(err) => write!(f, "runtime failure: {err}"),
        }
    }
}

impl Error for ServerError {}

impl From<TaskError> for ServerError {
    fn from(err: TaskError) -> Self {
        ServerError::Runtime(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_mapping() {
        assert_eq!(HttpError::from(TaskError::Timeout), HttpError::Timeout);
        assert_eq!(HttpError::from(TaskError::Cancelled), HttpError::Cancelled);
        assert_eq!(
            HttpError::from(TaskError::Os(libc::ECONNRESET)),
            HttpError::Io(libc::ECONNRESET)
        );
        assert_eq!(HttpError::from(ArenaError::OutOfMemory), HttpError::OutOfMemory);
    }
}
