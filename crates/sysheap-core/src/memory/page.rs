use std::ptr::NonNull;
use std::sync::Arc;

use bitflags::bitflags;

use super::Pfn;
use crate::util::n_pages;

bitflags! {
    /// Allocation flags for page and block requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GfpFlags: u32 {
        /// Regular kernel allocation, may block while memory is reclaimed
        const KERNEL = 1 << 0;
        /// The frame may come from high memory, which has no linear kernel mapping
        const HIGHMEM = 1 << 1;
        /// Zero-fill the memory before returning it
        const ZERO = 1 << 2;
    }
}

/// An owned reference to one allocated page frame.
///
/// Pages are neither `Clone` nor `Copy`: exactly one `Page` exists per
/// allocated frame, and it has to be handed back to the [`PageSource`] it came
/// from. Dropping a `Page` without freeing it leaks the frame.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "dropping a Page leaks its frame"]
pub struct Page {
    pfn: Pfn,
}

impl Page {
    pub(crate) fn new(pfn: Pfn) -> Self {
        Page { pfn }
    }

    /// Frame number backing this page.
    pub fn pfn(&self) -> Pfn {
        self.pfn
    }
}

/// A physically contiguous, linearly mapped block of low memory.
///
/// `len` is the requested length; the block occupies `ceil(len / PAGE_SIZE)`
/// frames starting at [`pfn`](ContigBlock::pfn).
#[derive(Debug)]
#[must_use = "dropping a ContigBlock leaks its frames"]
pub struct ContigBlock {
    pfn: Pfn,
    len: usize,
    vaddr: NonNull<u8>,
}

unsafe impl Send for ContigBlock {}
unsafe impl Sync for ContigBlock {}

impl ContigBlock {
    pub(crate) fn new(pfn: Pfn, len: usize, vaddr: NonNull<u8>) -> Self {
        ContigBlock { pfn, len, vaddr }
    }

    /// First frame of the block.
    pub fn pfn(&self) -> Pfn {
        self.pfn
    }

    /// Length of the block in bytes, exactly as requested.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the block has a length of 0.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of frames the block occupies.
    pub fn pages(&self) -> usize {
        n_pages(self.len).unwrap_or(usize::MAX)
    }

    /// Linear kernel address of the first byte.
    pub fn as_ptr(&self) -> *mut u8 {
        self.vaddr.as_ptr()
    }

    /// The block contents.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.vaddr.as_ptr(), self.len) }
    }
}

/// Source of single zero-filled page frames.
///
/// This is the leaf primitive of the page-list heap: pages are obtained and
/// released one at a time. [`PhysMem`](super::PhysMem) is the production
/// implementation; wrappers may inject failures.
pub trait PageSource: Send + Sync {
    /// Obtains one page, or `None` if no frame is available.
    fn alloc_page(&self, gfp: GfpFlags) -> Option<Page>;

    /// Releases a page obtained from [`alloc_page`](PageSource::alloc_page).
    fn free_page(&self, page: Page);

    /// Resolves a page to the frame that currently backs it.
    ///
    /// Returns `None` if the page does not refer to a live frame of this source.
    fn page_to_pfn(&self, page: &Page) -> Option<Pfn>;
}

impl<T: PageSource + ?Sized> PageSource for Arc<T> {
    fn alloc_page(&self, gfp: GfpFlags) -> Option<Page> {
        (**self).alloc_page(gfp)
    }

    fn free_page(&self, page: Page) {
        (**self).free_page(page)
    }

    fn page_to_pfn(&self, page: &Page) -> Option<Pfn> {
        (**self).page_to_pfn(page)
    }
}
