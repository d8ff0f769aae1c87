//! Monotonic clock for deadlines
//!
//! Deadlines are nanoseconds since process start, so they fit a `u64` and
//! compare with plain integer arithmetic.

use std::sync::OnceLock;
use std::time::Instant;

static START_INSTANT: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds elapsed since the first call in this process.
#[inline]
pub fn now_ns() -> u64 {
    let start = START_INSTANT.get_or_init(Instant::now);
    start.elapsed().as_nanos() as u64
}

/// Deadline `ms` milliseconds from now.
#[inline]
pub fn deadline_ms(ms: u64) -> u64 {
    now_ns() + ms * 1_000_000
}

/// Sentinel deadline for "wait forever": roughly fifty years out.
#[inline]
pub fn far_future() -> u64 {
    const FIFTY_YEARS_NS: u64 = 50 * 365 * 24 * 3600 * 1_000_000_000;
    now_ns() + FIFTY_YEARS_NS
}
