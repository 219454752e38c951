//! # Sysheap
//!
//! System heap backends for a device buffer allocation framework. Each heap
//! implements [`HeapOps`](sysheap_core::HeapOps) for one allocation strategy:
//!
//! - `system` (feature `system`): buffers assembled from single pages, mapped
//!   virtually contiguous and described by one scatter-gather segment per page.
//! - `contig` (feature `contig`): buffers backed by one physically contiguous
//!   block and described by a single segment.
//!
//! ```
//! use std::sync::Arc;
//! use sysheap::memory::PhysMem;
//! use sysheap::util::PAGE_SIZE;
//! use sysheap::PhysMemConfig;
//!
//! let mem = Arc::new(PhysMem::new(&PhysMemConfig::default()).unwrap());
//! let heap = sysheap::system::create(mem.clone());
//! let mut buffer = heap.allocate(3 * PAGE_SIZE, 0, 0).unwrap();
//! assert_eq!(heap.map_dma(&mut buffer).unwrap().nents(), 3);
//! heap.free(buffer);
//! assert_eq!(mem.allocated_pages(), 0);
//! sysheap::system::destroy(heap);
//! ```

pub use sysheap_core::*;

#[cfg(feature = "contig")]
pub use sysheap_contig as contig;
#[cfg(feature = "system")]
pub use sysheap_system as system;
