use std::os::fd::{AsRawFd, BorrowedFd};
use std::ptr::NonNull;

use log::warn;

/// Reserves `len` bytes of inaccessible address space.
///
/// The reservation is later filled with [`map_fixed_shared`] and released with
/// [`munmap`].
pub(crate) fn reserve_va(len: usize) -> std::io::Result<NonNull<u8>> {
    let p = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }
    NonNull::new(p as *mut u8).ok_or_else(|| std::io::Error::from(std::io::ErrorKind::OutOfMemory))
}

/// Maps `len` bytes of `fd` starting at `offset` over `addr`, replacing what was there.
///
/// # Safety
///
/// `addr..addr + len` must lie inside a reservation owned by the caller.
pub(crate) unsafe fn map_fixed_shared(
    addr: *mut u8,
    len: usize,
    fd: BorrowedFd<'_>,
    offset: usize,
) -> std::io::Result<()> {
    let p = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            fd.as_raw_fd(),
            offset as libc::off_t,
        )
    };
    if p == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }
    debug_assert_eq!(p as usize, addr as usize);
    Ok(())
}

/// Unmap memory
///
/// Failures are logged, not propagated; this runs from `Drop` implementations.
///
/// # Safety
/// * `addr` must be a valid pointer to a memory region previously mapped by `mmap`
/// * `len` must be less than or equal the length of that region
pub(crate) unsafe fn munmap(addr: *mut u8, len: usize) {
    let r = unsafe { libc::munmap(addr as *mut libc::c_void, len) };
    if r != 0 {
        warn!(
            "munmap({:x}, {}): {}",
            addr as usize,
            len,
            std::io::Error::last_os_error()
        );
    }
}
