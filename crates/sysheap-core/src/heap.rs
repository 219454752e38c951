//! The heap operation table and the heap instance that carries it.
//!
//! A heap backend implements [`HeapOps`] once per allocation strategy. The
//! allocation framework wraps it in a [`Heap`], which tags the instance with
//! its [`HeapType`] and forwards buffer operations to it.

use std::fmt;
use std::ptr::NonNull;

use log::{debug, warn};
use serde::Serialize;

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::memory::{KernelMapping, PhysAddr, PhysMem, SgTable, UserRegion};
use crate::util::n_pages;

/// Type tag of a heap instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeapType {
    /// Non-contiguous memory assembled from single pages
    System,
    /// Physically contiguous memory
    SystemContig,
}

impl fmt::Display for HeapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapType::System => write!(f, "system"),
            HeapType::SystemContig => write!(f, "system_contig"),
        }
    }
}

/// Operation table of a heap strategy.
///
/// Every operation runs to completion on the calling thread and may block
/// while memory is acquired. Implementations hold no locks of their own: the
/// caller serialises all operations on one buffer, while operations on
/// different buffers may run concurrently.
///
/// # Required Methods
///
/// * [`heap_type()`](HeapOps::heap_type), [`phys_mem()`](HeapOps::phys_mem)
/// * [`allocate()`](HeapOps::allocate), [`free()`](HeapOps::free)
/// * [`map_dma()`](HeapOps::map_dma), [`map_user()`](HeapOps::map_user)
///
/// The kernel mapping operations and [`unmap_dma()`](HeapOps::unmap_dma) have
/// shared default implementations that work for every [`HeapMemory`](crate::HeapMemory)
/// variant.
pub trait HeapOps: Send + Sync {
    /// Type tag of this heap.
    fn heap_type(&self) -> HeapType;

    /// Physical memory this heap allocates from.
    fn phys_mem(&self) -> &PhysMem;

    /// Allocates backing memory for `buffer`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the memory cannot be obtained. On
    /// error nothing stays allocated.
    fn allocate(&self, buffer: &mut Buffer, size: usize, align: usize, flags: u64) -> Result<()>;

    /// Releases the backing memory of `buffer`.
    ///
    /// The buffer must have been allocated by this heap and not freed since;
    /// nothing here guards against a second call.
    fn free(&self, buffer: &mut Buffer);

    /// Physical address and length of a buffer backed by a single range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`] unless the heap overrides it.
    fn phys(&self, _buffer: &Buffer) -> Result<(PhysAddr, usize)> {
        Err(Error::Unsupported)
    }

    /// Builds a fresh scatter-gather table describing `buffer`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the table cannot be allocated and
    /// [`Error::Translation`] if a page cannot be resolved. No partially built
    /// table survives an error.
    fn map_dma(&self, buffer: &Buffer) -> Result<SgTable>;

    /// Releases the cached scatter-gather table of `buffer`.
    ///
    /// Only the table is released; the memory it describes stays with the buffer.
    fn unmap_dma(&self, buffer: &mut Buffer) {
        if let Some(table) = buffer.take_sg_table() {
            debug!("unmap_dma: dropping table with {} segments", table.nents());
        }
    }

    /// Maps `buffer` into one virtually contiguous kernel range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAllocated`] for a buffer without memory, or the
    /// error of the mapping itself.
    fn map_kernel(&self, buffer: &Buffer) -> Result<KernelMapping> {
        let memory = buffer.memory()?;
        let pfns = memory.pfns();
        debug_assert_eq!(Some(pfns.len()), n_pages(buffer.size()));
        KernelMapping::vm_map_ram(self.phys_mem(), &pfns)
    }

    /// Tears down the cached kernel mapping of `buffer`.
    ///
    /// The memory behind the mapping stays with the buffer.
    fn unmap_kernel(&self, buffer: &mut Buffer) {
        if let Some(mapping) = buffer.take_vaddr() {
            debug!("unmap_kernel: {:p}, {} bytes", mapping.addr(), mapping.len());
        }
    }

    /// Maps `buffer` into `region`.
    ///
    /// # Errors
    ///
    /// Strategy specific; see the implementing heap.
    fn map_user(&self, buffer: &Buffer, region: &mut dyn UserRegion) -> Result<()>;
}

/// A heap instance: a type tag plus the operation table serving it.
///
/// The instance holds no other state. Besides forwarding, it keeps the
/// buffer's cached kernel mapping and scatter-gather table up to date.
pub struct Heap {
    heap_type: HeapType,
    ops: Box<dyn HeapOps>,
}

impl Heap {
    /// Creates a heap instance around `ops`.
    pub fn new(ops: impl HeapOps + 'static) -> Self {
        let heap_type = ops.heap_type();
        debug!("Created {} heap", heap_type);
        Heap {
            heap_type,
            ops: Box::new(ops),
        }
    }

    /// Releases the heap instance.
    pub fn destroy(self) {
        debug!("Destroyed {} heap", self.heap_type);
    }

    /// Type tag of this heap.
    pub fn heap_type(&self) -> HeapType {
        self.heap_type
    }

    /// The operation table.
    pub fn ops(&self) -> &dyn HeapOps {
        self.ops.as_ref()
    }

    /// Allocates a buffer of `size` bytes.
    ///
    /// # Errors
    ///
    /// Forwards the error of [`HeapOps::allocate`].
    pub fn allocate(&self, size: usize, align: usize, flags: u64) -> Result<Buffer> {
        let mut buffer = Buffer::new(size, flags);
        self.ops.allocate(&mut buffer, size, align, flags)?;
        Ok(buffer)
    }

    /// Tears down every cached mapping of `buffer` and releases its memory.
    pub fn free(&self, mut buffer: Buffer) {
        if !buffer.is_allocated() {
            warn!("free: {} byte buffer is not allocated", buffer.size());
            return;
        }
        if buffer.sg_table().is_some() {
            self.ops.unmap_dma(&mut buffer);
        }
        if buffer.vaddr().is_some() {
            self.ops.unmap_kernel(&mut buffer);
        }
        self.ops.free(&mut buffer);
    }

    /// Physical address and length of `buffer`.
    ///
    /// # Errors
    ///
    /// Forwards the error of [`HeapOps::phys`].
    pub fn phys(&self, buffer: &Buffer) -> Result<(PhysAddr, usize)> {
        self.ops.phys(buffer)
    }

    /// Builds a scatter-gather table for `buffer` and caches it there.
    ///
    /// A previously cached table is replaced.
    ///
    /// # Errors
    ///
    /// Forwards the error of [`HeapOps::map_dma`]; the cache is left untouched.
    pub fn map_dma<'b>(&self, buffer: &'b mut Buffer) -> Result<&'b SgTable> {
        let table = self.ops.map_dma(buffer)?;
        Ok(buffer.set_sg_table(table))
    }

    /// Releases the cached scatter-gather table of `buffer`.
    pub fn unmap_dma(&self, buffer: &mut Buffer) {
        self.ops.unmap_dma(buffer)
    }

    /// Maps `buffer` into kernel space, or returns the cached mapping.
    ///
    /// # Errors
    ///
    /// Forwards the error of [`HeapOps::map_kernel`].
    pub fn map_kernel(&self, buffer: &mut Buffer) -> Result<NonNull<u8>> {
        if let Some(mapping) = buffer.vaddr() {
            return Ok(mapping.addr());
        }
        let mapping = self.ops.map_kernel(buffer)?;
        let addr = mapping.addr();
        buffer.set_vaddr(mapping);
        Ok(addr)
    }

    /// Tears down the cached kernel mapping of `buffer`.
    pub fn unmap_kernel(&self, buffer: &mut Buffer) {
        self.ops.unmap_kernel(buffer)
    }

    /// Maps `buffer` into `region`.
    ///
    /// # Errors
    ///
    /// Forwards the error of [`HeapOps::map_user`].
    pub fn map_user(&self, buffer: &Buffer, region: &mut dyn UserRegion) -> Result<()> {
        self.ops.map_user(buffer, region)
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("heap_type", &self.heap_type)
            .finish_non_exhaustive()
    }
}
