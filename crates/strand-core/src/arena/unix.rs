//! Unix memory primitives for the arena using mmap/mprotect
//!
//! The arena reserves its whole ceiling up front with PROT_NONE and commits
//! or decommits page ranges as the bump pointer moves. Only this file talks
//! to the OS.

use crate::error::ArenaError;
use std::ptr::NonNull;

/// Query the system page size.
pub fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as usize
    }
}

/// Reserve `len` bytes of address space with no access permissions.
///
/// Physical memory is not charged until pages are committed.
pub fn reserve(len: usize) -> Result<NonNull<u8>, ArenaError> {
    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(ArenaError::ReserveFailed);
    }
    NonNull::new(base as *mut u8).ok_or(ArenaError::ReserveFailed)
}

/// Make `[addr, addr+len)` readable and writable.
pub fn commit(addr: *mut u8, len: usize) -> Result<(), ArenaError> {
    let ret = unsafe {
        libc::mprotect(
            addr as *mut libc::c_void,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
        )
    };
    if ret != 0 {
        return Err(ArenaError::ProtectFailed);
    }
    Ok(())
}

/// Return `[addr, addr+len)` to the kernel and revoke access.
///
/// The address range stays reserved; a later commit brings back zero pages.
pub fn decommit(addr: *mut u8, len: usize) -> Result<(), ArenaError> {
    unsafe {
        libc::madvise(addr as *mut libc::c_void, len, libc::MADV_DONTNEED);
    }
    let ret = unsafe { libc::mprotect(addr as *mut libc::c_void, len, libc::PROT_NONE) };
    if ret != 0 {
        return Err(ArenaError::ProtectFailed);
    }
    Ok(())
}

/// Release the entire reservation.
pub fn release(addr: *mut u8, len: usize) {
    unsafe {
        libc::munmap(addr as *mut libc::c_void, len);
    }
}
