//! Epoch-style usage: the pattern a connection follows across pipelined
//! requests. Everything allocated after the accept-time marker is discarded
//! in one free, and containers are rebuilt on the shrunken arena.

use std::rc::Rc;
use strand_core::{kib, mib, Arena, Buffer, StrMultiMap};

#[test]
fn request_epochs_do_not_accumulate() {
    let arena = Rc::new(Arena::new(kib(16), mib(2)).unwrap());

    // Accept-time allocations stay below the marker.
    let mut line_buffer = Buffer::with_capacity(arena.clone(), kib(8)).unwrap();
    let marker = arena.mark();
    let baseline = arena.used();

    for round in 0..100 {
        let mut headers = StrMultiMap::new(arena.clone(), 16);
        headers.add(b"Host", b"example.com").unwrap();
        headers.add(b"Accept", b"text/html").unwrap();
        headers.add(b"Accept", b"application/json").unwrap();

        let mut body = Buffer::with_capacity(arena.clone(), 256).unwrap();
        body.write(format!("round {round}").as_bytes()).unwrap();
        assert!(arena.used() > baseline);

        headers.clear();
        drop(headers);
        drop(body);
        arena.free(marker);
        assert_eq!(arena.used(), baseline);
        assert!(arena.capacity() <= arena.ceiling());
    }

    // The accept-time buffer is still intact below the marker.
    line_buffer.write(b"GET / HTTP/1.1\r\n").unwrap();
    assert!(line_buffer.as_slice().ends_with(b"\r\n"));
}

#[test]
fn ceiling_bounds_total_growth() {
    let arena = Rc::new(Arena::new(kib(16), kib(64)).unwrap());
    let mut buf = Buffer::with_capacity(arena.clone(), kib(1)).unwrap();
    let chunk = [b'x'; 1024];
    let mut wrote = 0usize;
    loop {
        match buf.write(&chunk) {
            Ok(()) => wrote += chunk.len(),
            Err(_) => break,
        }
        assert!(wrote <= kib(64));
    }
    assert!(arena.capacity() <= arena.ceiling());
}
