//! Arena-backed growable byte buffer
//!
//! The workhorse behind connection line/content/response buffers. Growth
//! goes through the arena's realloc, so a buffer that happens to sit at the
//! bump tail extends in place without copying.

use crate::arena::Arena;
use crate::error::ArenaError;
use std::ptr::NonNull;
use std::rc::Rc;

pub struct Buffer {
    arena: Rc<Arena>,
    ptr: NonNull<u8>,
    len: usize,
    cap: usize,
}

impl Buffer {
    /// Allocate an empty buffer with `cap` bytes reserved in `arena`.
    pub fn with_capacity(arena: Rc<Arena>, cap: usize) -> Result<Self, ArenaError> {
        let cap = cap.max(1);
        let ptr = arena.alloc(cap, 1, false).ok_or(ArenaError::OutOfMemory)?;
        Ok(Self {
            arena,
            ptr,
            len: 0,
            cap,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // Safety: [ptr, ptr+len) is owned by this buffer and committed.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Ensure room for at least `extra` more bytes.
    pub fn reserve(&mut self, extra: usize) -> Result<(), ArenaError> {
        let needed = self.len.checked_add(extra).ok_or(ArenaError::OutOfMemory)?;
        if needed <= self.cap {
            return Ok(());
        }
        let new_cap = crate::next_pow2(needed);
        let ptr = self
            .arena
            .realloc(self.ptr, self.cap, new_cap, false)
            .ok_or(ArenaError::OutOfMemory)?;
        self.ptr = ptr;
        self.cap = new_cap;
        Ok(())
    }

    /// Append bytes, growing as needed.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), ArenaError> {
        self.reserve(bytes.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.ptr.as_ptr().add(self.len),
                bytes.len(),
            );
        }
        self.len += bytes.len();
        Ok(())
    }

    /// Append a single byte.
    pub fn push(&mut self, byte: u8) -> Result<(), ArenaError> {
        self.write(std::slice::from_ref(&byte))
    }

    /// The uninitialized tail between `len` and `cap`, for direct recv().
    #[inline]
    pub fn spare_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(self.len), self.cap - self.len)
        }
    }

    /// Declare `n` bytes of the spare tail as written.
    #[inline]
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.len + n <= self.cap);
        self.len += n;
    }

    /// Drop the first `n` bytes, shifting the rest to the front.
    pub fn drain_front(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        if n == 0 {
            return;
        }
        let rest = self.len - n;
        if rest > 0 {
            unsafe {
                std::ptr::copy(self.ptr.as_ptr().add(n), self.ptr.as_ptr(), rest);
            }
        }
        self.len = rest;
    }

    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
    }

    #[inline]
    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.len = len;
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len)
            .field("cap", &self.cap)
            .finish()
    }
}

impl std::fmt::Write for Buffer {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        self.write(s.as_bytes()).map_err(|_| std::fmt::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kib;

    fn arena() -> Rc<Arena> {
        Rc::new(Arena::new(kib(4), kib(256)).unwrap())
    }

    #[test]
    fn test_write_and_read_back() {
        let mut buf = Buffer::with_capacity(arena(), 8).unwrap();
        buf.write(b"hello ").unwrap();
        buf.write(b"world").unwrap();
        assert_eq!(buf.as_slice(), b"hello world");
        assert!(buf.capacity() >= 11);
    }

    #[test]
    fn test_drain_front() {
        let mut buf = Buffer::with_capacity(arena(), 32).unwrap();
        buf.write(b"GET / HTTP/1.1\r\nextra").unwrap();
        buf.drain_front(16);
        assert_eq!(buf.as_slice(), b"extra");
        buf.drain_front(5);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_spare_and_advance() {
        let mut buf = Buffer::with_capacity(arena(), 16).unwrap();
        let spare = buf.spare_mut();
        spare[..4].copy_from_slice(b"abcd");
        buf.advance(4);
        assert_eq!(buf.as_slice(), b"abcd");
        assert_eq!(buf.spare_mut().len(), 12);
    }

    #[test]
    fn test_growth_fails_at_arena_ceiling() {
        let a = Rc::new(Arena::new(kib(4), kib(8)).unwrap());
        let mut buf = Buffer::with_capacity(a, kib(4)).unwrap();
        let big = vec![0u8; kib(16)];
        assert_eq!(buf.write(&big), Err(ArenaError::OutOfMemory));
    }

    #[test]
    fn test_fmt_write() {
        use std::fmt::Write;
        let mut buf = Buffer::with_capacity(arena(), 8).unwrap();
        write!(buf, "status={} len={}", 200, 13).unwrap();
        assert_eq!(buf.as_slice(), b"status=200 len=13");
    }
}
