//! Hot-path benchmarks: the per-request epoch (mark, alloc, free), buffer
//! growth through realloc, and the header multimap.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::rc::Rc;
use strand_core::{kib, mib, Arena, Buffer, StrMultiMap};

fn bench_arena_epoch(c: &mut Criterion) {
    let arena = Arena::new(kib(16), mib(2)).unwrap();
    c.bench_function("arena_epoch_64x256", |b| {
        b.iter(|| {
            let mark = arena.mark();
            for _ in 0..64 {
                black_box(arena.alloc(black_box(256), 8, false).unwrap());
            }
            arena.free(mark);
        })
    });
}

fn bench_buffer_write(c: &mut Criterion) {
    let arena = Rc::new(Arena::new(kib(16), mib(4)).unwrap());
    let payload = [0u8; 512];
    c.bench_function("buffer_write_16x512", |b| {
        b.iter(|| {
            let mark = arena.mark();
            let mut buf = Buffer::with_capacity(arena.clone(), 256).unwrap();
            for _ in 0..16 {
                buf.write(black_box(&payload)).unwrap();
            }
            black_box(buf.len());
            drop(buf);
            arena.free(mark);
        })
    });
}

fn bench_strmultimap(c: &mut Criterion) {
    let arena = Rc::new(Arena::new(kib(16), mib(4)).unwrap());
    c.bench_function("strmultimap_header_block", |b| {
        b.iter(|| {
            let mark = arena.mark();
            let mut map = StrMultiMap::new(arena.clone(), 16);
            map.add(b"Host", b"example.com").unwrap();
            map.add(b"Content-Type", b"text/plain").unwrap();
            map.add(b"Accept", b"*/*").unwrap();
            map.add(b"X-Multi", b"one").unwrap();
            map.add(b"X-Multi", b"two").unwrap();
            black_box(map.get(b"Host"));
            black_box(map.count(b"X-Multi"));
            drop(map);
            arena.free(mark);
        })
    });
}

criterion_group!(
    benches,
    bench_arena_epoch,
    bench_buffer_write,
    bench_strmultimap
);
criterion_main!(benches);
