//! End-to-end connection tests over a socketpair: real scheduler, real
//! reads and writes, responses checked byte-for-byte on the client end.

use std::os::unix::io::{FromRawFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;
use strand_core::{kib, Arena};
use strand_http::codec::{Request, Response};
use strand_http::conn::Conn;
use strand_http::config::ServerOptions;
use strand_http::error::HttpError;
use strand_http::router::Router;
use strand_http::tcp::TcpStream;
use strand_http::Method;
use strand_runtime::{shutdown, sleep, spawn};

/// A connected pair; index 0 (the server end) is nonblocking.
fn pair() -> (RawFd, RawFd) {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    unsafe {
        let flags = libc::fcntl(fds[0], libc::F_GETFL);
        libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
    (fds[0], fds[1])
}

fn start_conn(server_fd: RawFd, options: ServerOptions, router: Router) {
    let router = Arc::new(router);
    let options = Arc::new(options);
    let arena = Rc::new(Arena::new(kib(16), options.mem_connection_max).unwrap());
    let task_arena = arena.clone();
    let cleanup_arena = arena.clone();
    spawn(
        &arena,
        kib(64),
        move || {
            let stream = unsafe { TcpStream::from_raw_fd(server_fd) };
            let conn = Conn::new(task_arena, stream, router, &options).unwrap();
            conn.run();
        },
        move || drop(cleanup_arena),
    )
    .unwrap();
}

fn send_bytes(fd: RawFd, bytes: &[u8]) {
    let n = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
    assert_eq!(n, bytes.len() as isize);
}

/// Blocking read until the server closes its end.
fn read_until_close(fd: RawFd) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
        out.extend_from_slice(&buf[..n as usize]);
    }
    out
}

fn echo(_: &Rc<Arena>, req: &Request, resp: &mut Response) -> Result<(), HttpError> {
    resp.body.write(req.method.as_str().as_bytes())?;
    resp.body.write(b" ")?;
    resp.body.write(req.path())?;
    Ok(())
}

fn body_echo(_: &Rc<Arena>, req: &Request, resp: &mut Response) -> Result<(), HttpError> {
    resp.body.write(req.content())?;
    Ok(())
}

fn exhaust(arena: &Rc<Arena>, _: &Request, _: &mut Response) -> Result<(), HttpError> {
    while arena.alloc(64, 8, false).is_some() {}
    Err(HttpError::OutOfMemory)
}

fn test_router() -> Router {
    let mut router = Router::new();
    router
        .add(Method::Get, "/echo", echo)
        .add(Method::Post, "/body", body_echo)
        .add(Method::Get, "/exhaust", exhaust);
    router
}

fn test_options() -> ServerOptions {
    ServerOptions::new().inactivity_timeout_ms(2_000)
}

#[test]
fn get_with_close_round_trip() {
    let (server_fd, client_fd) = pair();
    send_bytes(
        client_fd,
        b"GET /echo HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n",
    );
    start_conn(server_fd, test_options(), test_router());
    shutdown(5_000).unwrap();

    let reply = read_until_close(client_fd);
    let text = String::from_utf8(reply).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
    assert!(text.contains("\r\nConnection: close\r\n"));
    assert!(text.ends_with("\r\n\r\nGET /echo"));
    unsafe { libc::close(client_fd) };
}

#[test]
fn pipelined_requests_both_answered() {
    let (server_fd, client_fd) = pair();
    send_bytes(
        client_fd,
        b"GET /echo HTTP/1.1\r\nHost: t\r\n\r\n\
          GET /echo HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n",
    );
    start_conn(server_fd, test_options(), test_router());
    shutdown(5_000).unwrap();

    let text = String::from_utf8(read_until_close(client_fd)).unwrap();
    assert_eq!(text.matches("HTTP/1.1 200 OK\r\n").count(), 2, "got: {text}");
    assert_eq!(text.matches("GET /echo").count(), 2);
    unsafe { libc::close(client_fd) };
}

#[test]
fn fixed_length_body_is_delivered() {
    let (server_fd, client_fd) = pair();
    send_bytes(
        client_fd,
        b"POST /body HTTP/1.1\r\nHost: t\r\nContent-Length: 11\r\n\
          Connection: close\r\n\r\nhello world",
    );
    start_conn(server_fd, test_options(), test_router());
    shutdown(5_000).unwrap();

    let text = String::from_utf8(read_until_close(client_fd)).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
    assert!(text.contains("\r\nContent-Length: 11\r\n"));
    assert!(text.ends_with("\r\n\r\nhello world"));
    unsafe { libc::close(client_fd) };
}

#[test]
fn chunked_body_reassembled_across_reads() {
    let (server_fd, client_fd) = pair();
    start_conn(server_fd, test_options(), test_router());

    // Client task dribbles the request out in pieces, crossing chunk
    // boundaries mid-write, so every parse state takes the
    // park-and-resume path at least once.
    let client_arena = Rc::new(Arena::new(kib(16), kib(64)).unwrap());
    let client_cleanup = client_arena.clone();
    spawn(
        &client_arena,
        kib(32),
        move || {
            let pieces: [&[u8]; 6] = [
                b"POST /body HTTP/1.1\r\nHost: t\r\nTransfer-Enco",
                b"ding: chunked\r\nConnection: close\r\n\r\n",
                b"4\r\nabcd\r",
                b"\n5\r\nefghi\r\n",
                b"0\r\nX-Trailer: done\r",
                b"\n\r\n",
            ];
            for piece in pieces {
                send_bytes(client_fd, piece);
                sleep(10).unwrap();
            }
        },
        move || drop(client_cleanup),
    )
    .unwrap();

    shutdown(5_000).unwrap();

    let text = String::from_utf8(read_until_close(client_fd)).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
    assert!(text.ends_with("\r\n\r\nabcdefghi"));
    unsafe { libc::close(client_fd) };
}

#[test]
fn malformed_request_line_gets_400_and_close() {
    let (server_fd, client_fd) = pair();
    send_bytes(client_fd, b"BLARG / HTTP/1.1\r\nHost: t\r\n\r\n");
    start_conn(server_fd, test_options(), test_router());
    shutdown(5_000).unwrap();

    let text = String::from_utf8(read_until_close(client_fd)).unwrap();
    assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "got: {text}");
    assert!(text.contains("\r\nConnection: close\r\n"));
    unsafe { libc::close(client_fd) };
}

#[test]
fn oversized_header_line_gets_400() {
    let (server_fd, client_fd) = pair();
    let mut request = Vec::from(&b"GET /echo HTTP/1.1\r\nHost: t\r\nX-Big: "[..]);
    request.extend(std::iter::repeat(b'a').take(kib(2)));
    request.extend_from_slice(b"\r\n\r\n");
    send_bytes(client_fd, &request);

    start_conn(
        server_fd,
        test_options().line_buffer_size(kib(1)),
        test_router(),
    );
    shutdown(5_000).unwrap();

    let text = String::from_utf8(read_until_close(client_fd)).unwrap();
    assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "got: {text}");
    unsafe { libc::close(client_fd) };
}

#[test]
fn content_over_phase_ceiling_gets_400() {
    let (server_fd, client_fd) = pair();
    let mut options = test_options();
    options.mem_content_max = 512;

    let mut request = Vec::from(
        &b"POST /body HTTP/1.1\r\nHost: t\r\nContent-Length: 4096\r\n\r\n"[..],
    );
    request.extend(std::iter::repeat(b'b').take(4096));
    send_bytes(client_fd, &request);

    start_conn(server_fd, options, test_router());
    shutdown(5_000).unwrap();

    let text = String::from_utf8(read_until_close(client_fd)).unwrap();
    assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "got: {text}");
    unsafe { libc::close(client_fd) };
}

#[test]
fn handler_arena_exhaustion_closes_only_that_connection() {
    let (bad_server, bad_client) = pair();
    let (ok_server, ok_client) = pair();

    send_bytes(bad_client, b"GET /exhaust HTTP/1.1\r\nHost: t\r\n\r\n");
    send_bytes(
        ok_client,
        b"GET /echo HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n",
    );

    start_conn(bad_server, test_options(), test_router());
    start_conn(ok_server, test_options(), test_router());
    shutdown(5_000).unwrap();

    // The exhausted connection cannot even serialize an error page; it
    // closes without a success response.
    let bad = String::from_utf8(read_until_close(bad_client)).unwrap();
    assert!(!bad.contains("200 OK"), "got: {bad}");

    // A sibling connection on the same scheduler is unaffected.
    let ok = String::from_utf8(read_until_close(ok_client)).unwrap();
    assert!(ok.starts_with("HTTP/1.1 200 OK\r\n"), "got: {ok}");
    assert!(ok.ends_with("\r\n\r\nGET /echo"));

    unsafe {
        libc::close(bad_client);
        libc::close(ok_client);
    }
}

#[test]
fn unknown_path_gets_404() {
    let (server_fd, client_fd) = pair();
    send_bytes(
        client_fd,
        b"GET /missing HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n",
    );
    start_conn(server_fd, test_options(), test_router());
    shutdown(5_000).unwrap();

    let text = String::from_utf8(read_until_close(client_fd)).unwrap();
    assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"), "got: {text}");
    assert!(text.ends_with("404 Not Found\n"));
    unsafe { libc::close(client_fd) };
}
