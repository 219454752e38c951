use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, trace};

use super::{Pfn, PhysMem};
use crate::error::{Error, Result};
use crate::util::{PAGE_SIZE, munmap, reserve_va};

#[derive(Debug)]
enum MappingKind {
    /// Private virtual range, unmapped on drop. Carries the arena's count of
    /// vmapped frames.
    Vmap(Arc<AtomicUsize>),
    /// View into the linear mapping of low memory
    Linear,
}

/// A kernel virtual mapping of buffer memory.
///
/// [`vm_map_ram`](KernelMapping::vm_map_ram) makes an arbitrary set of frames
/// virtually contiguous. Dropping such a mapping tears down the virtual range
/// only; the frames stay owned by whoever allocated them.
#[derive(Debug)]
pub struct KernelMapping {
    addr: NonNull<u8>,
    len: usize,
    kind: MappingKind,
}

unsafe impl Send for KernelMapping {}
unsafe impl Sync for KernelMapping {}

impl KernelMapping {
    /// Maps `pfns` in order into one fresh, virtually contiguous range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an empty frame list or frames
    /// outside `mem`, and [`Error::Map`] if the host refuses the mapping. No
    /// part of the range stays mapped on error.
    pub fn vm_map_ram(mem: &PhysMem, pfns: &[Pfn]) -> Result<Self> {
        if pfns.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let len = pfns
            .len()
            .checked_mul(PAGE_SIZE)
            .ok_or(Error::InvalidArgument)?;
        let addr = reserve_va(len)?;
        let vmapped = mem.vmap_counter();
        vmapped.fetch_add(pfns.len(), Ordering::AcqRel);
        // owns the reservation from here on, so early returns unmap it
        let mapping = KernelMapping {
            addr,
            len,
            kind: MappingKind::Vmap(vmapped),
        };
        for (i, pfn) in pfns.iter().enumerate() {
            let at = unsafe { addr.as_ptr().byte_add(i * PAGE_SIZE) };
            unsafe { mem.map_frames(at, *pfn, 1)? };
        }
        debug!("vm_map_ram: {} frames at {:p}", pfns.len(), addr);
        Ok(mapping)
    }

    /// Wraps a range of the linear low-memory mapping.
    ///
    /// Dropping the result unmaps nothing.
    pub fn linear(addr: NonNull<u8>, len: usize) -> Self {
        trace!("linear kernel mapping at {:p}, {} bytes", addr, len);
        KernelMapping {
            addr,
            len,
            kind: MappingKind::Linear,
        }
    }

    /// Start of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Start of the mapping.
    pub fn addr(&self) -> NonNull<u8> {
        self.addr
    }

    /// Length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the mapping has a length of 0.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns `true` if this is a view into the linear mapping.
    pub fn is_linear(&self) -> bool {
        matches!(self.kind, MappingKind::Linear)
    }

    /// The mapped bytes.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr.as_ptr(), self.len) }
    }

    /// The mapped bytes, writable.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.addr.as_ptr(), self.len) }
    }
}

impl Drop for KernelMapping {
    fn drop(&mut self) {
        if let MappingKind::Vmap(vmapped) = &self.kind {
            trace!("vm_unmap_ram {:p}, {} bytes", self.addr, self.len);
            unsafe { munmap(self.addr.as_ptr(), self.len) };
            vmapped.fetch_sub(self.len / PAGE_SIZE, Ordering::AcqRel);
        }
    }
}
