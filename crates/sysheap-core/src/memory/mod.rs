//! The `memory` module models the physical memory the heaps allocate from and
//! the views the rest of the system gets on it.
//!
//! - [`PhysMem`]: page frames split into a low zone (linearly mapped) and a high zone.
//! - [`Page`], [`ContigBlock`]: owned handles to a single frame or a contiguous run.
//! - [`PageSource`]: obtains and releases single pages.
//! - [`PageList`], [`PageTransaction`]: all-or-nothing acquisition of many pages.
//! - [`SgTable`]: the scatter-gather descriptor handed to DMA-capable devices.
//! - [`KernelMapping`]: kernel virtual mappings over frames.
//! - [`UserRegion`], [`Vma`]: address ranges of a requesting process.
mod page;
mod page_list;
mod phys_addr;
mod phys_mem;
mod sg_table;
mod vma;
mod vmap;

pub use self::page::{ContigBlock, GfpFlags, Page, PageSource};
pub use self::page_list::{PageList, PageTransaction};
pub use self::phys_addr::{Pfn, PhysAddr};
pub use self::phys_mem::PhysMem;
pub use self::sg_table::{SgEntry, SgTable};
pub use self::vma::{UserRegion, VmFlags, Vma};
pub use self::vmap::KernelMapping;
