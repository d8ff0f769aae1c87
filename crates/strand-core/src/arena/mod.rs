//! Region allocator
//!
//! A bump allocator over a single reserved address range. The full ceiling
//! (`max`) is reserved once with no access; pages are committed on growth and
//! decommitted again when usage collapses, so a long-lived connection does
//! not retain the high-water mark of its largest request.
//!
//! Growth doubles (next power of two of the required end), shrink triggers
//! only when usage falls to a quarter of the committed capacity. The
//! hysteresis keeps alternating alloc/free patterns from thrashing
//! mprotect calls.
//!
//! Invariant after every operation: `used <= capacity <= max`.
//!
//! Allocation failure is an `Option::None`, never a panic; callers translate
//! it into their own error taxonomy.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        use unix as sys;
    }
}

use crate::error::ArenaError;
use std::cell::Cell;
use std::ptr::NonNull;

/// A position in the arena, captured by [`Arena::mark`] and restored by
/// [`Arena::free`]. Everything allocated after the marker is discarded in
/// O(1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marker(usize);

/// Bump allocator over reserved, lazily-committed address space.
///
/// One arena per connection or scheduler; not shareable across threads.
pub struct Arena {
    base: NonNull<u8>,
    used: Cell<usize>,
    capacity: Cell<usize>,
    min: usize,
    max: usize,
    page_size: usize,
}

#[inline]
fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

impl Arena {
    /// Reserve `max` bytes of address space and commit the first `min`
    /// (both rounded up to the page size; `min` is at least one page).
    pub fn new(min: usize, max: usize) -> Result<Self, ArenaError> {
        let page_size = sys::page_size();
        let min = align_up(min.max(1), page_size);
        let max = align_up(max, page_size);
        if max == 0 || min > max {
            return Err(ArenaError::InvalidBounds);
        }

        let base = sys::reserve(max)?;
        if let Err(e) = sys::commit(base.as_ptr(), min) {
            sys::release(base.as_ptr(), max);
            return Err(e);
        }

        Ok(Self {
            base,
            used: Cell::new(0),
            capacity: Cell::new(min),
            min,
            max,
            page_size,
        })
    }

    /// Bytes currently allocated.
    #[inline]
    pub fn used(&self) -> usize {
        self.used.get()
    }

    /// Bytes currently committed (writable).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// The hard ceiling this arena can never exceed.
    #[inline]
    pub fn ceiling(&self) -> usize {
        self.max
    }

    /// Bytes still allocatable before the ceiling.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.max - self.used.get()
    }

    /// Capture the current bump position.
    #[inline]
    pub fn mark(&self) -> Marker {
        Marker(self.used.get())
    }

    /// Allocate `size` bytes at `align`. Returns `None` when the allocation
    /// would cross the ceiling; the arena is unchanged in that case.
    pub fn alloc(&self, size: usize, align: usize, zero: bool) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two());
        let begin = align_up(self.used.get(), align);
        let end = begin.checked_add(size)?;
        if end > self.max {
            return None;
        }

        if end > self.capacity.get() {
            let new_cap = crate::next_pow2(end).min(self.max);
            let old_cap = self.capacity.get();
            // Safety: [base+old_cap, base+new_cap) lies inside the reservation.
            let tail = unsafe { self.base.as_ptr().add(old_cap) };
            if sys::commit(tail, new_cap - old_cap).is_err() {
                return None;
            }
            self.capacity.set(new_cap);
        }

        self.used.set(end);
        // Safety: begin < end <= capacity, so the pointer is committed memory.
        let ptr = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(begin)) };
        if zero {
            unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, size) };
        }
        Some(ptr)
    }

    /// Grow an allocation from `old_size` to `new_size` bytes.
    ///
    /// When `ptr` is the most recent allocation the growth happens in place
    /// and the same pointer comes back. Otherwise a fresh block is allocated
    /// and the old bytes copied; the old block becomes an interior hole that
    /// is only reclaimed by [`Arena::free`].
    pub fn realloc(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        zero: bool,
    ) -> Option<NonNull<u8>> {
        if new_size <= old_size {
            return Some(ptr);
        }
        let offset = ptr.as_ptr() as usize - self.base.as_ptr() as usize;
        if offset + old_size == self.used.get() {
            // Most recent allocation, extend the tail in place.
            self.alloc(new_size - old_size, 1, zero)?;
            return Some(ptr);
        }
        let fresh = self.alloc(new_size, 1, false)?;
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), old_size);
            if zero {
                std::ptr::write_bytes(fresh.as_ptr().add(old_size), 0, new_size - old_size);
            }
        }
        Some(fresh)
    }

    /// Roll the bump position back to `marker`, discarding everything
    /// allocated after it. Decommits pages when usage has collapsed to a
    /// quarter of the committed capacity.
    pub fn free(&self, marker: Marker) {
        debug_assert!(marker.0 <= self.used.get());
        self.used.set(marker.0);

        let used = self.used.get();
        let cap = self.capacity.get();
        if cap > self.min && used <= cap / 4 {
            let new_cap = crate::next_pow2(used.saturating_mul(2))
                .max(self.min)
                .min(cap);
            if new_cap < cap {
                // Safety: [base+new_cap, base+cap) was committed above.
                let tail = unsafe { self.base.as_ptr().add(new_cap) };
                if sys::decommit(tail, cap - new_cap).is_ok() {
                    self.capacity.set(new_cap);
                }
            }
        }
    }

    /// Base address of the reservation. Offsets handed out by containers are
    /// relative to this.
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// View an allocated range as a byte slice.
    ///
    /// # Safety
    ///
    /// `[offset, offset+len)` must lie within the allocated region and must
    /// not alias a live `&mut` slice.
    #[inline]
    pub unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        std::slice::from_raw_parts(self.base.as_ptr().add(offset), len)
    }

    /// View an allocated range as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// Same as [`Arena::slice`], plus exclusivity of the range.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.base.as_ptr().add(offset), len)
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        sys::release(self.base.as_ptr(), self.max);
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("used", &self.used.get())
            .field("capacity", &self.capacity.get())
            .field("min", &self.min)
            .field("max", &self.max)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{kib, mib};

    #[test]
    fn test_invariant_holds_across_ops() {
        let arena = Arena::new(kib(4), kib(64)).unwrap();
        let check = |a: &Arena| {
            assert!(a.used() <= a.capacity());
            assert!(a.capacity() <= a.ceiling());
        };
        check(&arena);

        let mark = arena.mark();
        for _ in 0..32 {
            assert!(arena.alloc(1000, 8, false).is_some());
            check(&arena);
        }
        arena.free(mark);
        check(&arena);
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn test_alloc_fails_past_ceiling() {
        let arena = Arena::new(kib(4), kib(8)).unwrap();
        assert!(arena.alloc(kib(8), 1, false).is_some());
        assert!(arena.alloc(1, 1, false).is_none());
        // Failure leaves the arena untouched.
        assert_eq!(arena.used(), kib(8));
    }

    #[test]
    fn test_growth_commits_next_pow2() {
        let arena = Arena::new(kib(4), kib(64)).unwrap();
        assert_eq!(arena.capacity(), kib(4));
        arena.alloc(kib(5), 1, false).unwrap();
        assert_eq!(arena.capacity(), kib(8));
        arena.alloc(kib(20), 1, false).unwrap();
        assert_eq!(arena.capacity(), kib(32));
    }

    #[test]
    fn test_zero_fill() {
        let arena = Arena::new(kib(4), kib(16)).unwrap();
        let mark = arena.mark();
        let p = arena.alloc(64, 1, false).unwrap();
        unsafe { std::ptr::write_bytes(p.as_ptr(), 0xAA, 64) };
        arena.free(mark);
        let p2 = arena.alloc(64, 1, true).unwrap();
        assert_eq!(p.as_ptr(), p2.as_ptr());
        let bytes = unsafe { std::slice::from_raw_parts(p2.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_realloc_zero_copy_on_tail() {
        let arena = Arena::new(kib(4), kib(64)).unwrap();
        let p = arena.alloc(100, 1, false).unwrap();
        let q = arena.realloc(p, 100, 400, false).unwrap();
        assert_eq!(p.as_ptr(), q.as_ptr());
        assert_eq!(arena.used(), 400);
    }

    #[test]
    fn test_realloc_copies_when_not_tail() {
        let arena = Arena::new(kib(4), kib(64)).unwrap();
        let p = arena.alloc(16, 1, false).unwrap();
        unsafe { std::ptr::copy_nonoverlapping(b"0123456789abcdef".as_ptr(), p.as_ptr(), 16) };
        let _other = arena.alloc(8, 1, false).unwrap();
        let q = arena.realloc(p, 16, 64, false).unwrap();
        assert_ne!(p.as_ptr(), q.as_ptr());
        let bytes = unsafe { std::slice::from_raw_parts(q.as_ptr(), 16) };
        assert_eq!(bytes, b"0123456789abcdef");
    }

    #[test]
    fn test_free_shrinks_at_quarter_usage() {
        let arena = Arena::new(kib(4), mib(1)).unwrap();
        let mark = arena.mark();
        arena.alloc(kib(200), 1, false).unwrap();
        assert_eq!(arena.capacity(), kib(256));
        arena.free(mark);
        assert_eq!(arena.capacity(), kib(4));

        // Committed again after shrink, and readable as fresh zero pages.
        let p = arena.alloc(kib(16), 1, true).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), kib(16)) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_free_keeps_capacity_above_quarter() {
        let arena = Arena::new(kib(4), mib(1)).unwrap();
        arena.alloc(kib(200), 1, false).unwrap();
        let mark = arena.mark();
        arena.alloc(kib(20), 1, false).unwrap();
        arena.free(mark);
        // 200KiB used out of 256KiB committed, no shrink.
        assert_eq!(arena.capacity(), kib(256));
    }

    #[test]
    fn test_invalid_bounds() {
        assert!(Arena::new(kib(64), kib(4)).is_err());
        assert!(Arena::new(0, 0).is_err());
    }

    #[test]
    fn test_alignment() {
        let arena = Arena::new(kib(4), kib(16)).unwrap();
        arena.alloc(3, 1, false).unwrap();
        let p = arena.alloc(8, 64, false).unwrap();
        assert_eq!(p.as_ptr() as usize % 64, 0);
    }
}
