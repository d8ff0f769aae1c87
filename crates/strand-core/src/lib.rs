//! # strand-core
//!
//! Leaf crate for the strand HTTP stack: the region allocator, the
//! arena-backed byte buffer, the open-addressing string maps, and shared
//! utilities (error types, env helpers, kernel-style logging macros).
//!
//! Everything in this crate is single-threaded; per-connection
//! structures live in one arena and never cross worker threads.

pub mod arena;
pub mod buffer;
pub mod env;
pub mod error;
pub mod hash;
pub mod kprint;
pub mod strmap;

pub use arena::{Arena, Marker};
pub use buffer::Buffer;
pub use error::ArenaError;
pub use strmap::{AStr, StrMap, StrMultiMap};

/// Bytes in `n` kibibytes.
#[inline]
pub const fn kib(n: usize) -> usize {
    n * 1024
}

/// Bytes in `n` mebibytes.
#[inline]
pub const fn mib(n: usize) -> usize {
    n * 1024 * 1024
}

/// Round `n` up to the next power of two, saturating at `usize::MAX` for 0.
#[inline]
pub fn next_pow2(n: usize) -> usize {
    n.next_power_of_two()
}
