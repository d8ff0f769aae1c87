//! Nonblocking TCP with cooperative waits
//!
//! Thin wrappers over raw sockets. Every operation that would block parks
//! the calling task with [`wait_fd`] instead; the scheduler resumes it when
//! epoll reports readiness or the timeout fires. Sockets are always
//! `O_NONBLOCK`, so a stray blocking call can never stall a worker thread.

use crate::error::{HttpError, ServerError};
use std::ffi::CString;
use std::os::unix::io::RawFd;
use strand_runtime::wait_fd;

#[inline]
fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

fn set_nonblocking(fd: RawFd) -> Result<(), i32> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(last_errno());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(last_errno());
        }
    }
    Ok(())
}

fn setsockopt_int(fd: RawFd, level: i32, opt: i32, value: i32) -> Result<(), i32> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &value as *const i32 as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(last_errno());
    }
    Ok(())
}

/// Listening socket shared by all worker threads.
///
/// Accepting is the only operation performed on it after `bind`, and
/// `accept4` is atomic, so concurrent accepts from multiple schedulers
/// are safe.
pub struct TcpListener {
    fd: RawFd,
}

// Raw fd; all post-bind operations are kernel-atomic.
unsafe impl Send for TcpListener {}
unsafe impl Sync for TcpListener {}

impl TcpListener {
    /// Resolve `host:port` and bind a nonblocking listener.
    pub fn bind(host: &str, port: &str, backlog: usize) -> Result<Self, ServerError> {
        let chost = CString::new(host)
            .map_err(|_| ServerError::Listen(format!("host contains NUL: {host:?}")))?;
        let cport = CString::new(port)
            .map_err(|_| ServerError::Listen(format!("port contains NUL: {port:?}")))?;

        let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
        hints.ai_family = libc::AF_UNSPEC;
        hints.ai_socktype = libc::SOCK_STREAM;
        hints.ai_flags = libc::AI_PASSIVE;

        let mut info: *mut libc::addrinfo = std::ptr::null_mut();
        let rc = unsafe { libc::getaddrinfo(chost.as_ptr(), cport.as_ptr(), &hints, &mut info) };
        if rc != 0 {
            let msg = unsafe { std::ffi::CStr::from_ptr(libc::gai_strerror(rc)) };
            return Err(ServerError::Listen(format!(
                "getaddrinfo {host}:{port}: {}",
                msg.to_string_lossy()
            )));
        }

        let mut fd: RawFd = -1;
        let mut last_err = libc::EADDRNOTAVAIL;
        let mut cur = info;
        while !cur.is_null() {
            let ai = unsafe { &*cur };
            let sock = unsafe { libc::socket(ai.ai_family, ai.ai_socktype, ai.ai_protocol) };
            if sock >= 0 {
                let _ = setsockopt_int(sock, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1);
                let _ = setsockopt_int(sock, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1);
                if unsafe { libc::bind(sock, ai.ai_addr, ai.ai_addrlen) } == 0 {
                    fd = sock;
                    break;
                }
                last_err = last_errno();
                unsafe { libc::close(sock) };
            } else {
                last_err = last_errno();
            }
            cur = ai.ai_next;
        }
        unsafe { libc::freeaddrinfo(info) };

        if fd < 0 {
            return Err(ServerError::Listen(format!(
                "bind {host}:{port}: {}",
                std::io::Error::from_raw_os_error(last_err)
            )));
        }

        if let Err(e) = set_nonblocking(fd) {
            unsafe { libc::close(fd) };
            return Err(ServerError::Listen(format!(
                "fcntl: {}",
                std::io::Error::from_raw_os_error(e)
            )));
        }
        if unsafe { libc::listen(fd, backlog as i32) } < 0 {
            let e = last_errno();
            unsafe { libc::close(fd) };
            return Err(ServerError::Listen(format!(
                "listen: {}",
                std::io::Error::from_raw_os_error(e)
            )));
        }
        Ok(Self { fd })
    }

    #[inline]
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Local port after binding, useful when binding port 0.
    pub fn local_port(&self) -> Result<u16, HttpError> {
        let mut addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(self.fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if rc < 0 {
            return Err(HttpError::Io(last_errno()));
        }
        Ok(sockaddr_port(&addr))
    }

    /// Accept one connection, parking the task until one is pending.
    ///
    /// Must be called from a scheduler task. Returns `Cancelled` when the
    /// task is cancelled while parked, which is how a worker's accept loop
    /// learns about shutdown.
    pub fn accept(&self) -> Result<TcpStream, HttpError> {
        loop {
            let fd = unsafe {
                libc::accept4(
                    self.fd,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_NONBLOCK,
                )
            };
            if fd >= 0 {
                return Ok(TcpStream { fd });
            }
            match last_errno() {
                libc::EAGAIN => wait_fd(self.fd, false, 0)?,
                libc::EINTR | libc::ECONNABORTED => continue,
                e => return Err(HttpError::Io(e)),
            }
        }
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// One accepted connection. Owned by exactly one task.
pub struct TcpStream {
    fd: RawFd,
}

impl TcpStream {
    #[inline]
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Receive into `buf`, parking until data arrives or `timeout_ms`
    /// expires (0 waits forever). `Ok(0)` means the peer closed.
    pub fn recv(&self, buf: &mut [u8], timeout_ms: u64) -> Result<usize, HttpError> {
        loop {
            let n = unsafe {
                libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            match last_errno() {
                libc::EAGAIN => wait_fd(self.fd, false, timeout_ms)?,
                libc::EINTR => continue,
                e => return Err(HttpError::Io(e)),
            }
        }
    }

    /// Send as much of `buf` as one write accepts, parking until the socket
    /// is writable. Returns bytes sent; callers loop and drain.
    pub fn send(&self, buf: &[u8], timeout_ms: u64) -> Result<usize, HttpError> {
        loop {
            let n = unsafe {
                libc::send(
                    self.fd,
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                    libc::MSG_NOSIGNAL,
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            match last_errno() {
                libc::EAGAIN => wait_fd(self.fd, true, timeout_ms)?,
                libc::EINTR => continue,
                e => return Err(HttpError::Io(e)),
            }
        }
    }

    pub fn set_keepalive(&self, idle_secs: i32, count: i32, interval_secs: i32) {
        let _ = setsockopt_int(self.fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1);
        let _ = setsockopt_int(self.fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, idle_secs);
        let _ = setsockopt_int(self.fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, count);
        let _ = setsockopt_int(self.fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, interval_secs);
    }

    /// Abort the connection if transmitted data stays unacknowledged for
    /// `ms` milliseconds.
    pub fn set_user_timeout(&self, ms: u32) {
        let _ = setsockopt_int(self.fd, libc::IPPROTO_TCP, libc::TCP_USER_TIMEOUT, ms as i32);
    }

    pub fn set_nodelay(&self, on: bool) {
        let _ = setsockopt_int(self.fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on as i32);
    }

    /// Half-close both directions; the fd stays open until drop.
    pub fn shutdown(&self) {
        unsafe { libc::shutdown(self.fd, libc::SHUT_RDWR) };
    }

    /// Peer address as `ip:port`, for logging.
    pub fn peer(&self) -> String {
        let mut addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getpeername(self.fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if rc < 0 {
            return String::from("?");
        }
        format!("{}:{}", sockaddr_ip(&addr), sockaddr_port(&addr))
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

impl std::os::unix::io::FromRawFd for TcpStream {
    /// # Safety
    ///
    /// `fd` must be an open, nonblocking stream socket; the new value owns
    /// it and closes it on drop.
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self { fd }
    }
}

fn sockaddr_port(addr: &libc::sockaddr_storage) -> u16 {
    match addr.ss_family as i32 {
        libc::AF_INET => {
            let v4 = unsafe { &*(addr as *const _ as *const libc::sockaddr_in) };
            u16::from_be(v4.sin_port)
        }
        libc::AF_INET6 => {
            let v6 = unsafe { &*(addr as *const _ as *const libc::sockaddr_in6) };
            u16::from_be(v6.sin6_port)
        }
        _ => 0,
    }
}

fn sockaddr_ip(addr: &libc::sockaddr_storage) -> String {
    match addr.ss_family as i32 {
        libc::AF_INET => {
            let v4 = unsafe { &*(addr as *const _ as *const libc::sockaddr_in) };
            std::net::Ipv4Addr::from(u32::from_be(v4.sin_addr.s_addr)).to_string()
        }
        libc::AF_INET6 => {
            let v6 = unsafe { &*(addr as *const _ as *const libc::sockaddr_in6) };
            std::net::Ipv6Addr::from(v6.sin6_addr.s6_addr).to_string()
        }
        _ => String::from("?"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_ip_formats_v4_and_v6() {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        {
            let v4 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            v4.sin_family = libc::AF_INET as libc::sa_family_t;
            v4.sin_addr.s_addr = u32::from_be_bytes([127, 0, 0, 1]).to_be();
            v4.sin_port = 8080u16.to_be();
        }
        assert_eq!(sockaddr_ip(&storage), "127.0.0.1");
        assert_eq!(sockaddr_port(&storage), 8080);

        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        {
            let v6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            v6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            v6.sin6_addr.s6_addr[15] = 1;
            v6.sin6_port = 443u16.to_be();
        }
        assert_eq!(sockaddr_ip(&storage), "::1");
        assert_eq!(sockaddr_port(&storage), 443);
    }

    #[test]
    fn test_bind_ephemeral_port() {
        let listener = TcpListener::bind("127.0.0.1", "0", 8).unwrap();
        assert!(listener.as_raw_fd() >= 0);
        assert_ne!(listener.local_port().unwrap(), 0);
        let flags = unsafe { libc::fcntl(listener.as_raw_fd(), libc::F_GETFL) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);
    }

    #[test]
    fn test_bind_bad_host_fails() {
        let err = TcpListener::bind("no.such.host.invalid", "0", 8);
        assert!(err.is_err());
    }

    #[test]
    fn test_socket_options_on_pair() {
        let mut fds = [0; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        unsafe { libc::close(fds[1]) };
        let stream = TcpStream { fd: fds[0] };
        // TCP-level options fail silently on AF_UNIX; exercising the calls
        // checks the constants and struct layout compile and run.
        stream.set_keepalive(30, 3, 10);
        stream.set_nodelay(true);
        stream.set_user_timeout(1_000);
        stream.shutdown();
    }
}
