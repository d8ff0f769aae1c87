//! Readiness backend: epoll with edge-triggered one-shot registration
//!
//! The poller coroutine owns the blocking `epoll_wait`. Each loop pass it
//! pops elapsed deadlines from the wait-heap, waits on epoll for at most
//! the time to the next deadline (capped), resumes every ready task, and
//! finally gives the main task one pass of control; that last switch is
//! what lets `shutdown` observe the draining heap between iterations.
//!
//! SIGINT and SIGTERM are blocked on scheduler threads and surface as a
//! signalfd readiness event carrying a sentinel token; observing it sets
//! the cancellation flag and unparks the main task.

use crate::clock;
use crate::error::TaskError;
use crate::scheduler::{current, Scheduler};
use crate::task::{Task, QUEUE_REMOVED};
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use strand_core::{kerror, ktrace, kwarn};

/// Token marking the signalfd registration in the epoll set.
const SIGNAL_EPOLL_EVENT: u64 = u64::MAX;

/// Upper bound on tasks resumed per poller pass.
const READY_MAX: usize = 32;
/// Upper bound on deadline-driven wakes per pass; readiness events fill
/// the rest of the batch.
const TIMEOUT_MAX: usize = READY_MAX / 2;
/// Fallback epoll wait when no deadline is near (ms).
const WAIT_CAP_MS: i32 = 10_000;

/// Milliseconds to wait for `deadline`, clamped to the cap.
///
/// The clamp happens before the i32 cast: far-future deadlines (the
/// indefinite-wait sentinel among them) would otherwise truncate negative,
/// and a negative epoll timeout blocks forever.
fn wait_bound(deadline: u64, now: u64) -> i32 {
    if deadline <= now {
        return 0;
    }
    let ms = (deadline - now) / 1_000_000;
    ms.min(WAIT_CAP_MS as u64 - 1) as i32 + 1
}

/// Create the epoll instance and the signalfd, block the signals it
/// carries, and register it under the sentinel token.
pub(crate) fn poll_init() -> Result<(RawFd, RawFd), TaskError> {
    let epoll_fd = unsafe { libc::epoll_create1(0) };
    if epoll_fd == -1 {
        return Err(TaskError::last_os());
    }

    let signal_fd = unsafe {
        let mut signals: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut signals);
        libc::sigaddset(&mut signals, libc::SIGINT);
        libc::sigaddset(&mut signals, libc::SIGTERM);
        libc::pthread_sigmask(libc::SIG_BLOCK, &signals, std::ptr::null_mut());
        libc::signalfd(-1, &signals, 0)
    };
    if signal_fd == -1 {
        let err = TaskError::last_os();
        unsafe { libc::close(epoll_fd) };
        return Err(err);
    }

    let mut event = libc::epoll_event {
        events: (libc::EPOLLIN | libc::EPOLLET | libc::EPOLLONESHOT) as u32,
        u64: SIGNAL_EPOLL_EVENT,
    };
    if unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, signal_fd, &mut event) } == -1 {
        let err = TaskError::last_os();
        unsafe {
            libc::close(epoll_fd);
            libc::close(signal_fd);
        }
        return Err(err);
    }

    Ok((epoll_fd, signal_fd))
}

/// Register (or re-arm) a task's fd for one readiness event.
///
/// One-shot registrations persist disarmed after firing, so MOD is the
/// common case and ADD the first-wait fallback.
pub(crate) fn poll_add(epoll_fd: RawFd, task: NonNull<Task>) -> Result<(), TaskError> {
    let (fd, write) = unsafe {
        let t = task.as_ref();
        (t.fd, t.write)
    };
    if fd == -1 {
        return Ok(());
    }

    let direction = if write { libc::EPOLLOUT } else { libc::EPOLLIN };
    let mut event = libc::epoll_event {
        events: (direction | libc::EPOLLRDHUP | libc::EPOLLET | libc::EPOLLONESHOT) as u32,
        u64: task.as_ptr() as u64,
    };

    if unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut event) } == -1 {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno != libc::ENOENT {
            return Err(TaskError::Os(errno));
        }
        if unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event) } == -1 {
            return Err(TaskError::last_os());
        }
    }
    Ok(())
}

/// Drop a task's fd from the epoll set; already-gone registrations are
/// fine (the fd may have been closed).
pub(crate) fn poll_remove(epoll_fd: RawFd, task: NonNull<Task>) {
    let fd = unsafe { task.as_ref().fd };
    if fd == -1 {
        return;
    }
    let ret =
        unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
    if ret == -1 {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno != libc::ENOENT && errno != libc::EBADF {
            kwarn!("poller: epoll del failed for fd {}: errno {}", fd, errno);
        }
    }
}

/// The poller coroutine body. Runs for the scheduler's whole lifetime.
pub(crate) fn poller_main() {
    let mut sched_ptr = current().expect("scheduler exists while the poller is running");
    let sched: &mut Scheduler = unsafe { sched_ptr.as_mut() };

    let mut ready: [Option<NonNull<Task>>; READY_MAX] = [None; READY_MAX];
    let mut events: [libc::epoll_event; READY_MAX] =
        unsafe { std::mem::zeroed() };

    loop {
        let mut ready_count = 0;
        let mut timeout = WAIT_CAP_MS;

        // Deadline-driven wakes first; they also bound the epoll wait.
        while ready_count < TIMEOUT_MAX {
            let Some(deadline) = sched.queue.peek_deadline() else {
                break;
            };
            let now = clock::now_ns();
            if deadline <= now {
                let task = sched.queue.pop().expect("peeked entry exists");
                poll_remove(sched.epoll_fd, task);
                ready[ready_count] = Some(task);
                ready_count += 1;
                continue;
            }
            timeout = timeout.min(wait_bound(deadline, now));
            break;
        }

        if ready_count > 0 {
            timeout = 0;
        } else if sched.wake_deadline != u64::MAX {
            // The main task is draining in shutdown; wake it no later than
            // its own deadline instead of sitting out the full cap.
            timeout = timeout.min(wait_bound(sched.wake_deadline, clock::now_ns()));
        }

        let available = READY_MAX - ready_count;
        if available > 0 {
            let count = unsafe {
                libc::epoll_wait(
                    sched.epoll_fd,
                    events.as_mut_ptr(),
                    available as i32,
                    timeout,
                )
            };
            if count == -1 {
                let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                if errno != libc::EINTR {
                    kerror!("poller: epoll_wait failed: errno {}", errno);
                }
                if ready_count == 0 {
                    continue;
                }
            }

            for event in events.iter().take(count.max(0) as usize) {
                if event.u64 == SIGNAL_EPOLL_EVENT {
                    ktrace!("poller: shutdown signal observed");
                    sched.cancel = true;
                    let main_pos = unsafe { sched.main.as_ref().queuepos };
                    if main_pos != QUEUE_REMOVED {
                        if let Some(main) = sched.queue.remove(main_pos) {
                            poll_remove(sched.epoll_fd, main);
                        }
                    }
                } else {
                    let task = NonNull::new(event.u64 as *mut Task)
                        .expect("epoll token is a task pointer");
                    let pos = unsafe { task.as_ref().queuepos };
                    if pos != QUEUE_REMOVED {
                        sched.queue.remove(pos);
                    }
                    ready[ready_count] = Some(task);
                    ready_count += 1;
                }
            }
        }

        for slot in ready.iter_mut().take(ready_count) {
            if let Some(task) = slot.take() {
                sched.switch_to(task);
            }
        }

        // Give main a pass; it re-suspends immediately if it has nothing
        // to do, and shutdown uses this hook to watch the heap drain.
        let main = sched.main;
        sched.switch_to(main);
    }
}
