use std::ptr::NonNull;
use std::sync::Arc;

use log::{debug, warn};
use sysheap_core::memory::{
    ContigBlock, GfpFlags, KernelMapping, PhysAddr, PhysMem, SgEntry, SgTable, UserRegion,
};
use sysheap_core::{Buffer, Error, Heap, HeapMemory, HeapOps, HeapType, Result};

/// Contiguous system heap.
///
/// Buffers are backed by a zero-filled [`ContigBlock`] of exactly the requested
/// length, taken from low memory.
///
/// # Implementation
///
/// Implements [`sysheap_core::HeapOps`]. The kernel mapping is the block's
/// linear address, so mapping and unmapping it cost nothing.
pub struct ContigHeap {
    mem: Arc<PhysMem>,
}

impl ContigHeap {
    /// Creates a heap allocating from `mem`.
    pub fn new(mem: Arc<PhysMem>) -> Self {
        ContigHeap { mem }
    }

    fn block<'b>(&self, buffer: &'b Buffer) -> Result<&'b ContigBlock> {
        match buffer.memory()? {
            HeapMemory::Contig(block) => Ok(block),
            HeapMemory::Pages(_) => Err(Error::WrongMemoryKind),
        }
    }
}

/// Creates a contiguous heap instance over `mem`.
pub fn create(mem: Arc<PhysMem>) -> Heap {
    Heap::new(ContigHeap::new(mem))
}

/// Releases a heap instance created by [`create`].
pub fn destroy(heap: Heap) {
    heap.destroy()
}

impl HeapOps for ContigHeap {
    fn heap_type(&self) -> HeapType {
        HeapType::SystemContig
    }

    fn phys_mem(&self) -> &PhysMem {
        &self.mem
    }

    fn allocate(&self, buffer: &mut Buffer, size: usize, _align: usize, _flags: u64) -> Result<()> {
        let Some(block) = self.mem.alloc_contig(size, GfpFlags::KERNEL | GfpFlags::ZERO) else {
            warn!("No contiguous run for {} bytes", size);
            return Err(Error::OutOfMemory);
        };
        debug!("Allocated {} contiguous bytes at {:?}", size, block.pfn());
        buffer.set_priv_virt(HeapMemory::Contig(block));
        Ok(())
    }

    fn free(&self, buffer: &mut Buffer) {
        match buffer.take_priv_virt() {
            Some(HeapMemory::Contig(block)) => self.mem.free_contig(block),
            Some(other) => {
                warn!("free: buffer does not hold a contiguous block");
                buffer.set_priv_virt(other);
            }
            None => warn!("free: buffer is not allocated"),
        }
    }

    fn phys(&self, buffer: &Buffer) -> Result<(PhysAddr, usize)> {
        let block = self.block(buffer)?;
        let addr = self
            .mem
            .virt_to_phys(block.as_ptr())
            .ok_or(Error::Translation { index: 0 })?;
        Ok((addr, buffer.size()))
    }

    fn map_dma(&self, buffer: &Buffer) -> Result<SgTable> {
        let block = self.block(buffer)?;
        let mut table = SgTable::alloc(1)?;
        let pfn = self
            .mem
            .virt_to_page(block.as_ptr())
            .ok_or(Error::Translation { index: 0 })?;
        table.push(SgEntry::new(pfn, buffer.size(), 0))?;
        debug!("map_dma: one segment of {} bytes at {:?}", buffer.size(), pfn);
        Ok(table)
    }

    fn map_kernel(&self, buffer: &Buffer) -> Result<KernelMapping> {
        let block = self.block(buffer)?;
        let addr = NonNull::new(block.as_ptr()).ok_or(Error::NotAllocated)?;
        Ok(KernelMapping::linear(addr, block.len()))
    }

    /// Maps the region as one physical range, starting `region.pgoff()` pages
    /// into the block.
    ///
    /// Fails with [`Error::InvalidArgument`] if the page offset overflows the
    /// frame number. The region length is not checked against the block; only
    /// ranges past the end of physical memory are refused.
    fn map_user(&self, buffer: &Buffer, region: &mut dyn UserRegion) -> Result<()> {
        let block = self.block(buffer)?;
        let pfn = self
            .mem
            .virt_to_phys(block.as_ptr())
            .ok_or(Error::Translation { index: 0 })?
            .pfn();
        let first = pfn.checked_add(region.pgoff()).ok_or_else(|| {
            warn!("map_user: page offset {:#x} overflows {:?}", region.pgoff(), pfn);
            Error::InvalidArgument
        })?;
        let (start, len) = (region.start(), region.len());
        region.remap_pfn_range(&self.mem, start, first, len)?;
        debug!("map_user: {} bytes from {:?} at 0x{:x}", len, pfn, start);
        Ok(())
    }
}
