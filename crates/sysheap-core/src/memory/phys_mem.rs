use std::ops::Range;
use std::os::fd::{AsFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, trace, warn};

use super::{ContigBlock, GfpFlags, Page, PageSource, Pfn, PhysAddr};
use crate::config::PhysMemConfig;
use crate::error::{Error, Result};
use crate::util::{PAGE_SHIFT, PAGE_SIZE, map_fixed_shared, munmap, n_pages};

/// Simulated physical memory.
///
/// An arena of page frames backed by an anonymous memory file. Frame `n` lives
/// at file offset `n * PAGE_SIZE`, so any number of virtual mappings of a frame
/// observe the same bytes.
///
/// The first [`lowmem_pages`](PhysMem::lowmem_pages) frames form the low-memory
/// zone. Only low memory has a permanent linear kernel mapping
/// ([`page_address`](PhysMem::page_address)); high-memory frames are reachable
/// only through explicit mappings such as [`KernelMapping`](super::KernelMapping).
///
/// Frame bookkeeping sits behind a mutex, so an arena can be shared between
/// threads as `Arc<PhysMem>`.
pub struct PhysMem {
    fd: OwnedFd,
    base: NonNull<u8>,
    lowmem_pages: usize,
    total_pages: usize,
    frames: Mutex<FrameTable>,
    vmapped: Arc<AtomicUsize>,
}

unsafe impl Send for PhysMem {}
unsafe impl Sync for PhysMem {}

struct FrameTable {
    used: Vec<bool>,
    allocated: usize,
}

impl FrameTable {
    fn take_first_free(&mut self, range: Range<usize>) -> Option<usize> {
        let idx = range.into_iter().find(|&idx| !self.used[idx])?;
        self.used[idx] = true;
        self.allocated += 1;
        Some(idx)
    }

    fn take_run(&mut self, range: Range<usize>, count: usize) -> Option<usize> {
        let mut run_start = range.start;
        let mut run_len = 0;
        for idx in range {
            if self.used[idx] {
                run_start = idx + 1;
                run_len = 0;
                continue;
            }
            run_len += 1;
            if run_len == count {
                self.used[run_start..run_start + count].fill(true);
                self.allocated += count;
                return Some(run_start);
            }
        }
        None
    }

    /// Returns the number of frames that were actually in use.
    fn release(&mut self, start: usize, count: usize) -> usize {
        let mut released = 0;
        for used in &mut self.used[start..start + count] {
            if *used {
                *used = false;
                released += 1;
            }
        }
        self.allocated -= released;
        released
    }
}

impl PhysMem {
    /// Creates a new arena with the zone sizes given in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the arena would be empty or its
    /// size overflows, and [`Error::Map`] if the backing file cannot be created
    /// or mapped.
    pub fn new(config: &PhysMemConfig) -> Result<Self> {
        let total_pages = config
            .lowmem_pages
            .checked_add(config.highmem_pages)
            .ok_or(Error::InvalidArgument)?;
        if total_pages == 0 {
            return Err(Error::InvalidArgument);
        }
        let len = total_pages
            .checked_mul(PAGE_SIZE)
            .ok_or(Error::InvalidArgument)?;

        let raw = unsafe { libc::memfd_create(c"sysheap-physmem".as_ptr(), libc::MFD_CLOEXEC) };
        if raw == -1 {
            return Err(std::io::Error::last_os_error().into());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let len_off = libc::off_t::try_from(len).map_err(|_| Error::InvalidArgument)?;
        if unsafe { libc::ftruncate(raw, len_off) } == -1 {
            return Err(std::io::Error::last_os_error().into());
        }
        let p = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                raw,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }
        let base = NonNull::new(p as *mut u8).ok_or(Error::OutOfMemory)?;
        debug!(
            "Created physical memory: {} lowmem + {} highmem frames",
            config.lowmem_pages, config.highmem_pages
        );
        Ok(PhysMem {
            fd,
            base,
            lowmem_pages: config.lowmem_pages,
            total_pages,
            frames: Mutex::new(FrameTable {
                used: vec![false; total_pages],
                allocated: 0,
            }),
            vmapped: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn frames(&self) -> MutexGuard<'_, FrameTable> {
        // frame state is updated before anything can panic, poisoning is harmless
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Total number of frames.
    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    /// Number of frames in the low-memory zone.
    pub fn lowmem_pages(&self) -> usize {
        self.lowmem_pages
    }

    /// Number of frames in the high-memory zone.
    pub fn highmem_pages(&self) -> usize {
        self.total_pages - self.lowmem_pages
    }

    /// Number of frames currently allocated.
    pub fn allocated_pages(&self) -> usize {
        self.frames().allocated
    }

    /// Number of frames currently mapped through live `vm_map_ram` ranges.
    pub fn vmapped_pages(&self) -> usize {
        self.vmapped.load(Ordering::Acquire)
    }

    pub(crate) fn vmap_counter(&self) -> Arc<AtomicUsize> {
        self.vmapped.clone()
    }

    /// Number of frames currently free.
    pub fn free_pages(&self) -> usize {
        self.total_pages - self.allocated_pages()
    }

    /// Returns `true` if `pfn` belongs to the low-memory zone.
    pub fn is_lowmem(&self, pfn: Pfn) -> bool {
        pfn.as_usize() < self.lowmem_pages
    }

    fn frame_ptr(&self, pfn: Pfn) -> *mut u8 {
        debug_assert!(pfn.as_usize() < self.total_pages);
        unsafe { self.base.as_ptr().byte_add(pfn.as_usize() << PAGE_SHIFT) }
    }

    fn zero_frames(&self, pfn: Pfn, count: usize) {
        unsafe { std::ptr::write_bytes(self.frame_ptr(pfn), 0, count * PAGE_SIZE) };
    }

    /// Allocates one frame.
    ///
    /// With [`GfpFlags::HIGHMEM`] the high zone is tried first and low memory
    /// serves as fallback; otherwise only low memory is used.
    pub fn alloc_page(&self, gfp: GfpFlags) -> Option<Page> {
        let idx = {
            let mut frames = self.frames();
            let high = if gfp.contains(GfpFlags::HIGHMEM) {
                frames.take_first_free(self.lowmem_pages..self.total_pages)
            } else {
                None
            };
            high.or_else(|| frames.take_first_free(0..self.lowmem_pages))?
        };
        let pfn = Pfn::new(idx);
        if gfp.contains(GfpFlags::ZERO) {
            self.zero_frames(pfn, 1);
        }
        trace!("alloc_page -> {:?}", pfn);
        Some(Page::new(pfn))
    }

    /// Returns a frame to the free state.
    pub fn free_page(&self, page: Page) {
        let pfn = page.pfn();
        if pfn.as_usize() >= self.total_pages {
            warn!("free_page: {:?} is outside physical memory", pfn);
            return;
        }
        if self.frames().release(pfn.as_usize(), 1) == 0 {
            warn!("free_page: {:?} was not allocated", pfn);
        }
        trace!("free_page {:?}", pfn);
    }

    /// Resolves `page` to its frame if the frame is currently allocated.
    pub fn page_to_pfn(&self, page: &Page) -> Option<Pfn> {
        let pfn = page.pfn();
        let frames = self.frames();
        frames.used.get(pfn.as_usize()).copied()?.then_some(pfn)
    }

    /// Allocates `len` bytes of physically contiguous low memory.
    ///
    /// The block occupies `ceil(len / PAGE_SIZE)` frames. Returns `None` if
    /// `len` is zero or no free run of that many low-memory frames exists.
    pub fn alloc_contig(&self, len: usize, gfp: GfpFlags) -> Option<ContigBlock> {
        let count = n_pages(len)?;
        if count == 0 {
            return None;
        }
        let idx = self.frames().take_run(0..self.lowmem_pages, count)?;
        let pfn = Pfn::new(idx);
        if gfp.contains(GfpFlags::ZERO) {
            self.zero_frames(pfn, count);
        }
        let vaddr = NonNull::new(self.frame_ptr(pfn))?;
        debug!("alloc_contig({}) -> {:?} ({} frames)", len, pfn, count);
        Some(ContigBlock::new(pfn, len, vaddr))
    }

    /// Releases a block obtained from [`alloc_contig`](PhysMem::alloc_contig).
    pub fn free_contig(&self, block: ContigBlock) {
        let start = block.pfn().as_usize();
        let count = block.pages();
        if start.saturating_add(count) > self.lowmem_pages {
            warn!("free_contig: {:?} is outside low memory", block.pfn());
            return;
        }
        let released = self.frames().release(start, count);
        if released != count {
            warn!(
                "free_contig: {} of {} frames at {:?} were not allocated",
                count - released,
                count,
                block.pfn()
            );
        }
        debug!("free_contig {:?} ({} frames)", block.pfn(), count);
    }

    /// Linear kernel address of a low-memory frame.
    ///
    /// Returns `None` for high-memory frames and frames outside the arena.
    pub fn page_address(&self, pfn: Pfn) -> Option<NonNull<u8>> {
        if !self.is_lowmem(pfn) {
            return None;
        }
        NonNull::new(self.frame_ptr(pfn))
    }

    /// Translates a linear kernel address to its physical address.
    ///
    /// Returns `None` if `addr` is not inside the low-memory linear mapping.
    pub fn virt_to_phys(&self, addr: *const u8) -> Option<PhysAddr> {
        let offset = (addr as usize).checked_sub(self.base.as_ptr() as usize)?;
        (offset < (self.lowmem_pages << PAGE_SHIFT)).then(|| PhysAddr::new(offset))
    }

    /// Translates a linear kernel address to the frame containing it.
    pub fn virt_to_page(&self, addr: *const u8) -> Option<Pfn> {
        self.virt_to_phys(addr).map(|phys| phys.pfn())
    }

    /// Copies the current contents of a frame.
    pub fn frame_bytes(&self, pfn: Pfn) -> Option<Vec<u8>> {
        if pfn.as_usize() >= self.total_pages {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts(self.frame_ptr(pfn), PAGE_SIZE) }.to_vec())
    }

    /// Maps `count` frames starting at `pfn` over `addr`.
    ///
    /// # Safety
    ///
    /// `addr..addr + count * PAGE_SIZE` must lie inside an address range
    /// reservation owned by the caller.
    pub(crate) unsafe fn map_frames(&self, addr: *mut u8, pfn: Pfn, count: usize) -> Result<()> {
        let end = pfn
            .as_usize()
            .checked_add(count)
            .ok_or(Error::InvalidArgument)?;
        if count == 0 || end > self.total_pages {
            return Err(Error::InvalidArgument);
        }
        trace!("map {} frames at {:?} to {:p}", count, pfn, addr);
        unsafe {
            map_fixed_shared(
                addr,
                count * PAGE_SIZE,
                self.fd.as_fd(),
                pfn.as_usize() << PAGE_SHIFT,
            )?
        };
        Ok(())
    }
}

impl PageSource for PhysMem {
    fn alloc_page(&self, gfp: GfpFlags) -> Option<Page> {
        PhysMem::alloc_page(self, gfp)
    }

    fn free_page(&self, page: Page) {
        PhysMem::free_page(self, page)
    }

    fn page_to_pfn(&self, page: &Page) -> Option<Pfn> {
        PhysMem::page_to_pfn(self, page)
    }
}

impl Drop for PhysMem {
    fn drop(&mut self) {
        let allocated = self.frames().allocated;
        if allocated != 0 {
            warn!("Dropping physical memory with {} frames still allocated", allocated);
        }
        unsafe { munmap(self.base.as_ptr(), self.total_pages * PAGE_SIZE) };
    }
}

impl std::fmt::Debug for PhysMem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysMem")
            .field("lowmem_pages", &self.lowmem_pages)
            .field("total_pages", &self.total_pages)
            .field("allocated_pages", &self.allocated_pages())
            .field("vmapped_pages", &self.vmapped_pages())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> PhysMem {
        PhysMem::new(&PhysMemConfig {
            lowmem_pages: 8,
            highmem_pages: 4,
        })
        .expect("physical memory")
    }

    #[test]
    fn test_empty_arena_rejected() {
        let config = PhysMemConfig {
            lowmem_pages: 0,
            highmem_pages: 0,
        };
        assert!(matches!(PhysMem::new(&config), Err(Error::InvalidArgument)));
    }

    #[test]
    fn test_highmem_preferred() {
        let mem = small();
        let page = mem.alloc_page(GfpFlags::KERNEL | GfpFlags::HIGHMEM).unwrap();
        assert!(!mem.is_lowmem(page.pfn()));
        assert!(mem.page_address(page.pfn()).is_none());
        let low = mem.alloc_page(GfpFlags::KERNEL).unwrap();
        assert!(mem.is_lowmem(low.pfn()));
        assert!(mem.page_address(low.pfn()).is_some());
        assert_eq!(mem.allocated_pages(), 2);
        mem.free_page(page);
        mem.free_page(low);
        assert_eq!(mem.allocated_pages(), 0);
    }

    #[test]
    fn test_highmem_falls_back_to_lowmem() {
        let mem = small();
        let pages: Vec<_> = (0..12)
            .map(|_| mem.alloc_page(GfpFlags::HIGHMEM).unwrap())
            .collect();
        assert_eq!(mem.free_pages(), 0);
        assert!(mem.alloc_page(GfpFlags::HIGHMEM).is_none());
        for page in pages {
            mem.free_page(page);
        }
        assert_eq!(mem.free_pages(), 12);
    }

    #[test]
    fn test_zeroed_page() {
        let mem = small();
        let page = mem.alloc_page(GfpFlags::KERNEL).unwrap();
        let ptr = mem.page_address(page.pfn()).unwrap();
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0xAB, PAGE_SIZE) };
        let pfn = page.pfn();
        mem.free_page(page);
        let page = mem.alloc_page(GfpFlags::KERNEL | GfpFlags::ZERO).unwrap();
        assert_eq!(page.pfn(), pfn);
        assert!(mem.frame_bytes(pfn).unwrap().iter().all(|b| *b == 0));
        mem.free_page(page);
    }

    #[test]
    fn test_page_to_pfn_requires_live_frame() {
        let mem = small();
        let page = mem.alloc_page(GfpFlags::KERNEL).unwrap();
        let pfn = page.pfn();
        assert_eq!(mem.page_to_pfn(&page), Some(pfn));
        mem.free_page(page);
        assert_eq!(mem.page_to_pfn(&Page::new(pfn)), None);
        assert_eq!(mem.page_to_pfn(&Page::new(Pfn::new(100))), None);
    }

    #[test]
    fn test_contig_first_fit() {
        let mem = small();
        let hole = mem.alloc_page(GfpFlags::KERNEL).unwrap();
        let pinned = mem.alloc_page(GfpFlags::KERNEL).unwrap();
        mem.free_page(hole);
        // frame 0 is free, frame 1 pinned: a 2-frame block must start at 2
        let block = mem.alloc_contig(PAGE_SIZE + 1, GfpFlags::ZERO).unwrap();
        assert_eq!(block.pfn(), Pfn::new(2));
        assert_eq!(block.len(), PAGE_SIZE + 1);
        assert_eq!(block.pages(), 2);
        assert!(block.as_slice().iter().all(|b| *b == 0));
        assert_eq!(mem.virt_to_phys(block.as_ptr()), Some(Pfn::new(2).phys()));
        assert_eq!(mem.allocated_pages(), 3);
        mem.free_contig(block);
        mem.free_page(pinned);
        assert_eq!(mem.allocated_pages(), 0);
    }

    #[test]
    fn test_contig_never_uses_highmem() {
        let mem = small();
        assert!(mem.alloc_contig(9 * PAGE_SIZE, GfpFlags::KERNEL).is_none());
        assert!(mem.alloc_contig(0, GfpFlags::KERNEL).is_none());
        let block = mem.alloc_contig(8 * PAGE_SIZE, GfpFlags::KERNEL).unwrap();
        assert_eq!(mem.lowmem_pages(), mem.allocated_pages());
        mem.free_contig(block);
    }

    #[test]
    fn test_virt_to_phys_outside_lowmem() {
        let mem = small();
        let outside = 0x1000 as *const u8;
        assert_eq!(mem.virt_to_phys(outside), None);
    }
}
