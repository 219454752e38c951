use log::warn;

use crate::error::{Error, Result};
use crate::memory::{ContigBlock, KernelMapping, PageList, Pfn, SgTable};

/// Backing memory of a buffer, one variant per heap strategy.
#[derive(Debug)]
pub enum HeapMemory {
    /// Individually allocated pages, in buffer order
    Pages(PageList),
    /// One physically contiguous block
    Contig(ContigBlock),
}

impl HeapMemory {
    /// Frame numbers backing the buffer, in buffer order.
    pub fn pfns(&self) -> Vec<Pfn> {
        match self {
            HeapMemory::Pages(pages) => pages.pfns(),
            HeapMemory::Contig(block) => (0..block.pages()).map(|i| block.pfn() + i).collect(),
        }
    }

    /// Number of frames backing the buffer.
    pub fn page_count(&self) -> usize {
        match self {
            HeapMemory::Pages(pages) => pages.len(),
            HeapMemory::Contig(block) => block.pages(),
        }
    }
}

/// A buffer record as tracked by the allocation framework.
///
/// The framework owns the record. A heap fills in the backing memory on
/// allocation and takes it out again on free; the cached kernel mapping and
/// scatter-gather table are stored here by whoever created them.
#[derive(Debug)]
pub struct Buffer {
    size: usize,
    flags: u64,
    priv_virt: Option<HeapMemory>,
    vaddr: Option<KernelMapping>,
    sg_table: Option<SgTable>,
}

impl Buffer {
    /// Creates an unallocated buffer record of `size` bytes.
    pub fn new(size: usize, flags: u64) -> Self {
        Buffer {
            size,
            flags,
            priv_virt: None,
            vaddr: None,
            sg_table: None,
        }
    }

    /// Requested size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Allocation flags the buffer was requested with.
    pub fn flags(&self) -> u64 {
        self.flags
    }

    /// Returns `true` if the buffer has backing memory.
    pub fn is_allocated(&self) -> bool {
        self.priv_virt.is_some()
    }

    /// The backing memory.
    pub fn priv_virt(&self) -> Option<&HeapMemory> {
        self.priv_virt.as_ref()
    }

    /// The backing memory, or [`Error::NotAllocated`].
    pub fn memory(&self) -> Result<&HeapMemory> {
        self.priv_virt.as_ref().ok_or(Error::NotAllocated)
    }

    /// Installs the backing memory.
    pub fn set_priv_virt(&mut self, memory: HeapMemory) {
        debug_assert!(self.priv_virt.is_none(), "buffer allocated twice");
        self.priv_virt = Some(memory);
    }

    /// Removes the backing memory.
    pub fn take_priv_virt(&mut self) -> Option<HeapMemory> {
        self.priv_virt.take()
    }

    /// The cached kernel mapping.
    pub fn vaddr(&self) -> Option<&KernelMapping> {
        self.vaddr.as_ref()
    }

    /// The cached kernel mapping, writable.
    pub fn vaddr_mut(&mut self) -> Option<&mut KernelMapping> {
        self.vaddr.as_mut()
    }

    /// Caches a kernel mapping, dropping any previous one.
    pub fn set_vaddr(&mut self, mapping: KernelMapping) {
        self.vaddr = Some(mapping);
    }

    /// Removes the cached kernel mapping.
    pub fn take_vaddr(&mut self) -> Option<KernelMapping> {
        self.vaddr.take()
    }

    /// The cached scatter-gather table.
    pub fn sg_table(&self) -> Option<&SgTable> {
        self.sg_table.as_ref()
    }

    /// Caches a scatter-gather table, dropping any previous one, and returns
    /// the cached table.
    pub fn set_sg_table(&mut self, table: SgTable) -> &SgTable {
        self.sg_table.insert(table)
    }

    /// Removes the cached scatter-gather table.
    pub fn take_sg_table(&mut self) -> Option<SgTable> {
        self.sg_table.take()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(memory) = &self.priv_virt {
            warn!(
                "Buffer of {} bytes dropped while allocated, leaking {} frames",
                self.size,
                memory.page_count()
            );
        }
    }
}
