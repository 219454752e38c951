use std::ptr::NonNull;

use bitflags::bitflags;
use log::{debug, trace};

use super::{Pfn, PhysMem};
use crate::error::{Error, Result};
use crate::util::{PAGE_MASK, PAGE_SHIFT, PAGE_SIZE, munmap, reserve_va};

bitflags! {
    /// Properties of a user address range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VmFlags: u32 {
        /// Readable
        const READ = 1 << 0;
        /// Writable
        const WRITE = 1 << 1;
        /// Shared with other mappings of the same memory
        const SHARED = 1 << 2;
        /// Pages must not be swapped out or merged
        const RESERVED = 1 << 3;
        /// Mapped as a raw frame range
        const PFNMAP = 1 << 4;
    }
}

/// A range of a process address space that buffer memory is mapped into.
///
/// Addresses handed to the insertion methods are absolute and must be page
/// aligned and inside `start()..end()`.
#[allow(clippy::len_without_is_empty)]
pub trait UserRegion {
    /// First address of the region.
    fn start(&self) -> usize;

    /// One past the last address of the region.
    fn end(&self) -> usize;

    /// Length of the region in bytes.
    fn len(&self) -> usize {
        self.end() - self.start()
    }

    /// Offset into the backing memory, in pages, at which the region starts.
    fn pgoff(&self) -> usize;

    /// Current flags of the region.
    fn flags(&self) -> VmFlags;

    /// Replaces the flags of the region.
    fn set_flags(&mut self, flags: VmFlags);

    /// Maps the single frame `pfn` at `uaddr`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the page does not fit the region,
    /// or the error of the underlying mapping call.
    fn insert_page(&mut self, mem: &PhysMem, uaddr: usize, pfn: Pfn) -> Result<()>;

    /// Maps `len` bytes of contiguous frames starting at `pfn` at `uaddr`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the range does not fit the region
    /// or physical memory, or the error of the underlying mapping call.
    fn remap_pfn_range(&mut self, mem: &PhysMem, uaddr: usize, pfn: Pfn, len: usize)
    -> Result<()>;
}

/// A reserved range of this process's address space, standing in for the
/// address space of a requesting process.
///
/// The range starts out inaccessible; inserted pages become readable and
/// writable. Dropping the region unmaps all of it.
#[derive(Debug)]
pub struct Vma {
    start: NonNull<u8>,
    len: usize,
    pgoff: usize,
    flags: VmFlags,
}

unsafe impl Send for Vma {}

impl Vma {
    /// Reserves a region of `len` bytes mapping backing memory from page `pgoff` on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `len` is zero or not a multiple of
    /// the page size, and [`Error::Map`] if the reservation fails.
    pub fn reserve(len: usize, pgoff: usize) -> Result<Self> {
        if len == 0 || len & PAGE_MASK != 0 {
            return Err(Error::InvalidArgument);
        }
        let start = reserve_va(len)?;
        debug!("Reserved user region {:p}, {} bytes, pgoff {}", start, len, pgoff);
        Ok(Vma {
            start,
            len,
            pgoff,
            flags: VmFlags::READ | VmFlags::WRITE | VmFlags::SHARED,
        })
    }

    /// Start of the region.
    pub fn as_ptr(&self) -> *mut u8 {
        self.start.as_ptr()
    }

    /// The bytes of the region.
    ///
    /// # Safety
    ///
    /// Every page of the region must have been mapped; reading an
    /// unmapped page faults.
    pub unsafe fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.start.as_ptr(), self.len) }
    }

    fn check_range(&self, uaddr: usize, len: usize) -> Result<*mut u8> {
        let offset = uaddr
            .checked_sub(self.start())
            .ok_or(Error::InvalidArgument)?;
        let end = offset.checked_add(len).ok_or(Error::InvalidArgument)?;
        if uaddr & PAGE_MASK != 0 || len == 0 || len & PAGE_MASK != 0 || end > self.len {
            return Err(Error::InvalidArgument);
        }
        Ok(unsafe { self.start.as_ptr().byte_add(offset) })
    }
}

impl UserRegion for Vma {
    fn start(&self) -> usize {
        self.start.as_ptr() as usize
    }

    fn end(&self) -> usize {
        self.start() + self.len
    }

    fn pgoff(&self) -> usize {
        self.pgoff
    }

    fn flags(&self) -> VmFlags {
        self.flags
    }

    fn set_flags(&mut self, flags: VmFlags) {
        self.flags = flags;
    }

    fn insert_page(&mut self, mem: &PhysMem, uaddr: usize, pfn: Pfn) -> Result<()> {
        let at = self.check_range(uaddr, PAGE_SIZE)?;
        trace!("insert {:?} at 0x{:x}", pfn, uaddr);
        unsafe { mem.map_frames(at, pfn, 1) }
    }

    fn remap_pfn_range(
        &mut self,
        mem: &PhysMem,
        uaddr: usize,
        pfn: Pfn,
        len: usize,
    ) -> Result<()> {
        let at = self.check_range(uaddr, len)?;
        trace!("remap {:?}.. at 0x{:x}, {} bytes", pfn, uaddr, len);
        unsafe { mem.map_frames(at, pfn, len >> PAGE_SHIFT)? };
        self.flags |= VmFlags::PFNMAP;
        Ok(())
    }
}

impl Drop for Vma {
    fn drop(&mut self) {
        unsafe { munmap(self.start.as_ptr(), self.len) };
    }
}
