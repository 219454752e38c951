use std::sync::Arc;

use log::{debug, trace, warn};
use sysheap_core::memory::{
    GfpFlags, PageList, PageSource, PageTransaction, PhysMem, SgEntry, SgTable, UserRegion,
    VmFlags,
};
use sysheap_core::util::{PAGE_SHIFT, PAGE_SIZE, n_pages};
use sysheap_core::{Buffer, Error, Heap, HeapMemory, HeapOps, HeapType, Result};

/// Page-list system heap.
///
/// Buffers are backed by `ceil(size / PAGE_SIZE)` pages, obtained one at a time
/// from a [`PageSource`] and allowed to come from high memory.
///
/// # Implementation
///
/// Implements [`sysheap_core::HeapOps`]. Kernel mappings use the shared
/// default (`vm_map_ram` over the page list).
pub struct SystemHeap {
    mem: Arc<PhysMem>,
    source: Arc<dyn PageSource>,
}

const GFP_MASK: GfpFlags = GfpFlags::KERNEL
    .union(GfpFlags::HIGHMEM)
    .union(GfpFlags::ZERO);

impl SystemHeap {
    /// Creates a heap allocating its pages directly from `mem`.
    pub fn new(mem: Arc<PhysMem>) -> Self {
        let source: Arc<dyn PageSource> = mem.clone();
        SystemHeap { mem, source }
    }

    /// Creates a heap that obtains pages from `source`.
    ///
    /// `source` must hand out frames of `mem`.
    pub fn with_source(mem: Arc<PhysMem>, source: Arc<dyn PageSource>) -> Self {
        SystemHeap { mem, source }
    }

    fn pages<'b>(&self, buffer: &'b Buffer) -> Result<&'b PageList> {
        match buffer.memory()? {
            HeapMemory::Pages(pages) => Ok(pages),
            HeapMemory::Contig(_) => Err(Error::WrongMemoryKind),
        }
    }
}

/// Creates a page-list heap instance over `mem`.
pub fn create(mem: Arc<PhysMem>) -> Heap {
    Heap::new(SystemHeap::new(mem))
}

/// Releases a heap instance created by [`create`].
pub fn destroy(heap: Heap) {
    heap.destroy()
}

impl HeapOps for SystemHeap {
    fn heap_type(&self) -> HeapType {
        HeapType::System
    }

    fn phys_mem(&self) -> &PhysMem {
        &self.mem
    }

    fn allocate(&self, buffer: &mut Buffer, size: usize, _align: usize, _flags: u64) -> Result<()> {
        let n_pages = n_pages(size).ok_or(Error::OutOfMemory)?;
        let mut txn = PageTransaction::with_capacity(self.source.as_ref(), n_pages)?;
        for i in 0..n_pages {
            if let Err(e) = txn.acquire(GFP_MASK) {
                warn!("Page allocation failed at {}/{}", i, n_pages);
                return Err(e);
            }
        }
        buffer.set_priv_virt(HeapMemory::Pages(txn.commit()));
        debug!("Allocated {} bytes in {} pages", size, n_pages);
        Ok(())
    }

    fn free(&self, buffer: &mut Buffer) {
        let pages = match buffer.take_priv_virt() {
            Some(HeapMemory::Pages(pages)) => pages,
            Some(other) => {
                warn!("free: buffer does not hold a page list");
                buffer.set_priv_virt(other);
                return;
            }
            None => {
                warn!("free: buffer is not allocated");
                return;
            }
        };
        debug_assert_eq!(Some(pages.len()), n_pages(buffer.size()));
        debug!("Freeing {} pages", pages.len());
        pages.release(self.source.as_ref());
    }

    fn map_dma(&self, buffer: &Buffer) -> Result<SgTable> {
        let pages = self.pages(buffer)?;
        let mut table = SgTable::alloc(pages.len())?;
        for (i, page) in pages.iter().enumerate() {
            let Some(pfn) = self.source.page_to_pfn(page) else {
                warn!("map_dma: page {} of {} has no frame", i, pages.len());
                return Err(Error::Translation { index: i });
            };
            table.push(SgEntry::new(pfn, PAGE_SIZE, 0))?;
        }
        debug!("map_dma: {} segments", table.nents());
        Ok(table)
    }

    /// Inserts the buffer's pages one by one, from the region start on.
    ///
    /// Fails with [`Error::InvalidArgument`] before inserting anything if the
    /// region is larger than the pages backing the buffer. The region's page
    /// offset is not taken into account.
    ///
    /// A failing insertion is returned as is. Pages inserted before it stay
    /// mapped; tearing down the region is left to the caller.
    fn map_user(&self, buffer: &Buffer, region: &mut dyn UserRegion) -> Result<()> {
        let pages = self.pages(buffer)?;
        let len = region.len();
        let backing = pages
            .len()
            .checked_mul(1 << PAGE_SHIFT)
            .ok_or(Error::InvalidArgument)?;
        if len > backing {
            warn!(
                "map_user: region of {} bytes exceeds {} backing bytes",
                len, backing
            );
            return Err(Error::InvalidArgument);
        }

        let start = region.start();
        for (page, uaddr) in pages.iter().zip((start..start + len).step_by(PAGE_SIZE)) {
            trace!("map_user: {:?} -> 0x{:x}", page.pfn(), uaddr);
            region.insert_page(&self.mem, uaddr, page.pfn())?;
        }
        region.set_flags(region.flags() | VmFlags::RESERVED);
        debug!("map_user: {} bytes at 0x{:x}", len, start);
        Ok(())
    }
}
