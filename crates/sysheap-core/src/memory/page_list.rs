use std::mem::size_of;

use log::{trace, warn};

use super::{GfpFlags, Page, PageSource, Pfn};
use crate::error::{Error, Result};

/// Ordered list of pages owned by one buffer.
///
/// The list is the sole owner of its pages between allocation and
/// [`release`](PageList::release).
#[derive(Debug, Default)]
pub struct PageList {
    pages: Vec<Page>,
}

impl PageList {
    /// Number of pages in the list.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Returns `true` if the list holds no pages.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Iterates over the pages in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Page> {
        self.pages.iter()
    }

    /// Returns the page at `index`.
    pub fn get(&self, index: usize) -> Option<&Page> {
        self.pages.get(index)
    }

    /// Frame numbers of all pages, in order.
    pub fn pfns(&self) -> Vec<Pfn> {
        self.pages.iter().map(Page::pfn).collect()
    }

    /// Hands every page back to `source`, consuming the list.
    pub fn release(self, source: &dyn PageSource) {
        for page in self.pages {
            source.free_page(page);
        }
    }
}

impl<'a> IntoIterator for &'a PageList {
    type Item = &'a Page;
    type IntoIter = std::slice::Iter<'a, Page>;

    fn into_iter(self) -> Self::IntoIter {
        self.pages.iter()
    }
}

/// All-or-nothing acquisition of a [`PageList`].
///
/// Pages pushed into a transaction are handed back to the source in reverse
/// order when the transaction is dropped, unless [`commit`](PageTransaction::commit)
/// was called. A failed acquisition therefore leaves no frame held.
///
/// ```
/// use sysheap_core::memory::{GfpFlags, PageTransaction, PhysMem};
/// use sysheap_core::PhysMemConfig;
///
/// let mem = PhysMem::new(&PhysMemConfig { lowmem_pages: 4, highmem_pages: 0 }).unwrap();
/// {
///     let mut txn = PageTransaction::with_capacity(&mem, 3).unwrap();
///     txn.acquire(GfpFlags::KERNEL).unwrap();
///     txn.acquire(GfpFlags::KERNEL).unwrap();
///     assert_eq!(mem.allocated_pages(), 2);
/// }
/// assert_eq!(mem.allocated_pages(), 0);
/// ```
pub struct PageTransaction<'a> {
    source: &'a dyn PageSource,
    pages: Vec<Page>,
}

impl<'a> PageTransaction<'a> {
    /// Starts a transaction with storage for `n_pages` page references.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if `n_pages` references do not fit in the
    /// address space or the storage cannot be reserved.
    pub fn with_capacity(source: &'a dyn PageSource, n_pages: usize) -> Result<Self> {
        n_pages
            .checked_mul(size_of::<Page>())
            .filter(|bytes| *bytes <= isize::MAX as usize)
            .ok_or(Error::OutOfMemory)?;
        let mut pages = Vec::new();
        pages
            .try_reserve_exact(n_pages)
            .map_err(|_| Error::OutOfMemory)?;
        Ok(PageTransaction { source, pages })
    }

    /// Number of pages acquired so far.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Returns `true` if nothing has been acquired yet.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Obtains one more page from the source.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the source has no page left. Pages
    /// acquired earlier stay in the transaction until it is dropped.
    pub fn acquire(&mut self, gfp: GfpFlags) -> Result<&Page> {
        let page = self.source.alloc_page(gfp).ok_or(Error::OutOfMemory)?;
        self.pages.push(page);
        Ok(&self.pages[self.pages.len() - 1])
    }

    /// Ends the transaction and keeps every acquired page.
    pub fn commit(mut self) -> PageList {
        PageList {
            pages: std::mem::take(&mut self.pages),
        }
    }
}

impl Drop for PageTransaction<'_> {
    fn drop(&mut self) {
        if self.pages.is_empty() {
            return;
        }
        warn!("Rolling back {} acquired pages", self.pages.len());
        while let Some(page) = self.pages.pop() {
            trace!("rollback {:?}", page.pfn());
            self.source.free_page(page);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PhysMemConfig;
    use crate::memory::PhysMem;
    use std::sync::Mutex;

    /// Records the order in which frames are released.
    struct Recorder<'a> {
        mem: &'a PhysMem,
        freed: Mutex<Vec<Pfn>>,
    }

    impl PageSource for Recorder<'_> {
        fn alloc_page(&self, gfp: GfpFlags) -> Option<Page> {
            self.mem.alloc_page(gfp)
        }
        fn free_page(&self, page: Page) {
            self.freed.lock().unwrap().push(page.pfn());
            self.mem.free_page(page)
        }
        fn page_to_pfn(&self, page: &Page) -> Option<Pfn> {
            self.mem.page_to_pfn(page)
        }
    }

    fn mem(pages: usize) -> PhysMem {
        PhysMem::new(&PhysMemConfig {
            lowmem_pages: pages,
            highmem_pages: 0,
        })
        .unwrap()
    }

    #[test]
    fn test_rollback_in_reverse_order() {
        let mem = mem(4);
        let recorder = Recorder {
            mem: &mem,
            freed: Mutex::new(vec![]),
        };
        let acquired: Vec<Pfn> = {
            let mut txn = PageTransaction::with_capacity(&recorder, 3).unwrap();
            (0..3)
                .map(|_| txn.acquire(GfpFlags::KERNEL).unwrap().pfn())
                .collect()
        };
        let mut expected = acquired.clone();
        expected.reverse();
        assert_eq!(*recorder.freed.lock().unwrap(), expected);
        assert_eq!(mem.allocated_pages(), 0);
    }

    #[test]
    fn test_commit_keeps_pages() {
        let mem = mem(4);
        let mut txn = PageTransaction::with_capacity(&mem, 2).unwrap();
        txn.acquire(GfpFlags::KERNEL).unwrap();
        txn.acquire(GfpFlags::KERNEL).unwrap();
        let list = txn.commit();
        assert_eq!(list.len(), 2);
        assert_eq!(mem.allocated_pages(), 2);
        list.release(&mem);
        assert_eq!(mem.allocated_pages(), 0);
    }

    #[test]
    fn test_exhaustion() {
        let mem = mem(1);
        let mut txn = PageTransaction::with_capacity(&mem, 2).unwrap();
        txn.acquire(GfpFlags::KERNEL).unwrap();
        assert!(matches!(txn.acquire(GfpFlags::KERNEL), Err(Error::OutOfMemory)));
        assert_eq!(txn.len(), 1);
        drop(txn);
        assert_eq!(mem.allocated_pages(), 0);
    }

    #[test]
    fn test_capacity_overflow() {
        let mem = mem(1);
        assert!(matches!(
            PageTransaction::with_capacity(&mem, usize::MAX),
            Err(Error::OutOfMemory)
        ));
        assert!(matches!(
            PageTransaction::with_capacity(&mem, usize::MAX / size_of::<Page>()),
            Err(Error::OutOfMemory)
        ));
    }
}
