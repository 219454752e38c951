use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::{Rng, rng};
use sysheap::memory::{GfpFlags, Page, PageSource, Pfn, PhysMem, UserRegion, VmFlags, Vma};
use sysheap::util::PAGE_SIZE;
use sysheap::{Buffer, Error, HeapMemory, HeapOps, PhysMemConfig};
use sysheap_contig::ContigHeap;
use sysheap_system::SystemHeap;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn phys_mem(lowmem_pages: usize, highmem_pages: usize) -> anyhow::Result<Arc<PhysMem>> {
    Ok(Arc::new(PhysMem::new(&PhysMemConfig {
        lowmem_pages,
        highmem_pages,
    })?))
}

/// Page source that refuses the `fail_at`-th allocation and fails
/// translation of the `untranslatable`-th page.
struct FaultySource {
    mem: Arc<PhysMem>,
    allocs: AtomicUsize,
    fail_at: Option<usize>,
    translations: AtomicUsize,
    untranslatable: Option<usize>,
}

impl FaultySource {
    fn new(mem: Arc<PhysMem>) -> Self {
        FaultySource {
            mem,
            allocs: AtomicUsize::new(0),
            fail_at: None,
            translations: AtomicUsize::new(0),
            untranslatable: None,
        }
    }

    fn failing_alloc(mem: Arc<PhysMem>, index: usize) -> Self {
        FaultySource {
            fail_at: Some(index),
            ..Self::new(mem)
        }
    }

    fn failing_translation(mem: Arc<PhysMem>, index: usize) -> Self {
        FaultySource {
            untranslatable: Some(index),
            ..Self::new(mem)
        }
    }
}

impl PageSource for FaultySource {
    fn alloc_page(&self, gfp: GfpFlags) -> Option<Page> {
        let n = self.allocs.fetch_add(1, Ordering::SeqCst);
        if Some(n) == self.fail_at {
            return None;
        }
        self.mem.alloc_page(gfp)
    }

    fn free_page(&self, page: Page) {
        self.mem.free_page(page)
    }

    fn page_to_pfn(&self, page: &Page) -> Option<Pfn> {
        let n = self.translations.fetch_add(1, Ordering::SeqCst);
        if Some(n) == self.untranslatable {
            return None;
        }
        self.mem.page_to_pfn(page)
    }
}

/// User region that records insertions instead of mapping anything.
struct RecordingRegion {
    start: usize,
    len: usize,
    flags: VmFlags,
    inserted: Vec<(usize, Pfn)>,
    fail_at: Option<usize>,
}

impl RecordingRegion {
    fn new(pages: usize) -> Self {
        RecordingRegion {
            start: 0x7f00_0000_0000,
            len: pages * PAGE_SIZE,
            flags: VmFlags::READ | VmFlags::WRITE,
            inserted: vec![],
            fail_at: None,
        }
    }
}

impl UserRegion for RecordingRegion {
    fn start(&self) -> usize {
        self.start
    }
    fn end(&self) -> usize {
        self.start + self.len
    }
    fn pgoff(&self) -> usize {
        0
    }
    fn flags(&self) -> VmFlags {
        self.flags
    }
    fn set_flags(&mut self, flags: VmFlags) {
        self.flags = flags;
    }
    fn insert_page(&mut self, _mem: &PhysMem, uaddr: usize, pfn: Pfn) -> sysheap::Result<()> {
        if Some(self.inserted.len()) == self.fail_at {
            return Err(Error::OutOfMemory);
        }
        self.inserted.push((uaddr, pfn));
        Ok(())
    }
    fn remap_pfn_range(
        &mut self,
        _mem: &PhysMem,
        uaddr: usize,
        pfn: Pfn,
        _len: usize,
    ) -> sysheap::Result<()> {
        self.inserted.push((uaddr, pfn));
        Ok(())
    }
}

#[test]
fn test_page_count_matches_size() -> anyhow::Result<()> {
    init_logging();
    let mem = phys_mem(64, 64)?;
    let heap = sysheap_system::create(mem.clone());
    let mut rand = rng();
    for _ in 0..50 {
        let size = rand.random_range(1..=32 * PAGE_SIZE);
        let expected = size.div_ceil(PAGE_SIZE);
        let mut buffer = heap.allocate(size, 0, 0)?;
        assert_eq!(mem.allocated_pages(), expected);
        let table = heap.map_dma(&mut buffer)?;
        assert_eq!(table.nents(), expected);
        assert!(table.iter().all(|e| e.length() == PAGE_SIZE));
        assert!(table.total_len() >= size);
        heap.free(buffer);
        assert_eq!(mem.allocated_pages(), 0);
    }
    Ok(())
}

#[test]
fn test_rollback_at_every_index() -> anyhow::Result<()> {
    init_logging();
    let mem = phys_mem(16, 16)?;
    let n_pages = 8;
    for fail_at in 0..n_pages {
        let source = Arc::new(FaultySource::failing_alloc(mem.clone(), fail_at));
        let heap = SystemHeap::with_source(mem.clone(), source.clone());
        let mut buffer = Buffer::new(n_pages * PAGE_SIZE, 0);
        let result = heap.allocate(&mut buffer, n_pages * PAGE_SIZE, 0, 0);
        assert!(matches!(result, Err(Error::OutOfMemory)));
        assert!(!buffer.is_allocated());
        assert_eq!(mem.allocated_pages(), 0, "pages leaked failing at {}", fail_at);
        assert_eq!(source.allocs.load(Ordering::SeqCst), fail_at + 1);
    }
    Ok(())
}

#[test]
fn test_second_page_fails() -> anyhow::Result<()> {
    let mem = phys_mem(4, 0)?;
    let source = Arc::new(FaultySource::failing_alloc(mem.clone(), 1));
    let heap = sysheap::Heap::new(SystemHeap::with_source(mem.clone(), source));
    assert!(matches!(
        heap.allocate(2 * PAGE_SIZE, 0, 0),
        Err(Error::OutOfMemory)
    ));
    assert_eq!(mem.allocated_pages(), 0);
    Ok(())
}

#[test]
fn test_translation_failure_keeps_buffer() -> anyhow::Result<()> {
    let mem = phys_mem(8, 0)?;
    let source = Arc::new(FaultySource::failing_translation(mem.clone(), 2));
    let heap = SystemHeap::with_source(mem.clone(), source);
    let mut buffer = Buffer::new(4 * PAGE_SIZE, 0);
    heap.allocate(&mut buffer, 4 * PAGE_SIZE, 0, 0)?;
    assert!(matches!(
        heap.map_dma(&buffer),
        Err(Error::Translation { index: 2 })
    ));
    // the buffer is unaffected and a later mapping succeeds
    assert_eq!(mem.allocated_pages(), 4);
    assert_eq!(heap.map_dma(&buffer)?.nents(), 4);
    heap.free(&mut buffer);
    assert_eq!(mem.allocated_pages(), 0);
    Ok(())
}

#[test]
fn test_remap_dma_is_equivalent() -> anyhow::Result<()> {
    let mem = phys_mem(8, 8)?;
    for heap in [
        sysheap_system::create(mem.clone()),
        sysheap_contig::create(mem.clone()),
    ] {
        let mut buffer = heap.allocate(3 * PAGE_SIZE - 7, 0, 0)?;
        let first = heap.map_dma(&mut buffer)?.clone();
        heap.unmap_dma(&mut buffer);
        assert!(buffer.sg_table().is_none());
        let second = heap.map_dma(&mut buffer)?;
        assert_eq!(&first, second);
        heap.free(buffer);
    }
    assert_eq!(mem.allocated_pages(), 0);
    Ok(())
}

#[test]
fn test_map_user_too_large_inserts_nothing() -> anyhow::Result<()> {
    let mem = phys_mem(8, 0)?;
    let heap = sysheap_system::create(mem.clone());
    let buffer = heap.allocate(2 * PAGE_SIZE, 0, 0)?;
    let mut region = RecordingRegion::new(3);
    assert!(matches!(
        heap.map_user(&buffer, &mut region),
        Err(Error::InvalidArgument)
    ));
    assert!(region.inserted.is_empty());
    heap.free(buffer);
    Ok(())
}

#[test]
fn test_map_user_inserts_in_order() -> anyhow::Result<()> {
    let mem = phys_mem(8, 8)?;
    let heap = sysheap_system::create(mem.clone());
    let buffer = heap.allocate(3 * PAGE_SIZE, 0, 0)?;
    let mut region = RecordingRegion::new(2);
    heap.map_user(&buffer, &mut region)?;
    let Some(HeapMemory::Pages(pages)) = buffer.priv_virt() else {
        panic!("expected a page list");
    };
    let expected: Vec<(usize, Pfn)> = pages
        .iter()
        .take(2)
        .enumerate()
        .map(|(i, p)| (region.start + i * PAGE_SIZE, p.pfn()))
        .collect();
    assert_eq!(region.inserted, expected);
    assert!(region.flags.contains(VmFlags::RESERVED));
    heap.free(buffer);
    Ok(())
}

#[test]
fn test_map_user_failure_is_not_rolled_back() -> anyhow::Result<()> {
    let mem = phys_mem(8, 0)?;
    let heap = sysheap_system::create(mem.clone());
    let buffer = heap.allocate(4 * PAGE_SIZE, 0, 0)?;
    let mut region = RecordingRegion::new(4);
    region.fail_at = Some(2);
    assert!(matches!(
        heap.map_user(&buffer, &mut region),
        Err(Error::OutOfMemory)
    ));
    assert_eq!(region.inserted.len(), 2);
    assert!(!region.flags.contains(VmFlags::RESERVED));
    heap.free(buffer);
    Ok(())
}

#[test]
fn test_kernel_and_user_views_agree() -> anyhow::Result<()> {
    init_logging();
    let mem = phys_mem(8, 8)?;
    for heap in [
        sysheap_system::create(mem.clone()),
        sysheap_contig::create(mem.clone()),
    ] {
        let mut buffer = heap.allocate(3 * PAGE_SIZE, 0, 0)?;
        heap.map_kernel(&mut buffer)?;
        let mapping = buffer.vaddr_mut().expect("kernel mapping cached");
        assert!(mapping.as_slice().iter().all(|b| *b == 0));
        for (i, byte) in mapping.as_mut_slice().iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        let mut vma = Vma::reserve(3 * PAGE_SIZE, 0)?;
        heap.map_user(&buffer, &mut vma)?;
        let user = unsafe { vma.as_slice() };
        assert!(user.iter().enumerate().all(|(i, b)| *b == (i % 251) as u8));
        drop(vma);
        heap.unmap_kernel(&mut buffer);
        assert!(buffer.vaddr().is_none());
        assert_eq!(mem.vmapped_pages(), 0);
        heap.free(buffer);
    }
    assert_eq!(mem.allocated_pages(), 0);
    Ok(())
}

#[test]
fn test_contig_phys() -> anyhow::Result<()> {
    let mem = phys_mem(8, 0)?;
    let heap = ContigHeap::new(mem.clone());
    let mut buffer = Buffer::new(4096 + 1, 0);
    heap.allocate(&mut buffer, 4096 + 1, 0, 0)?;
    let (addr, len) = heap.phys(&buffer)?;
    assert_eq!(len, 4097);
    let Some(HeapMemory::Contig(block)) = buffer.priv_virt() else {
        panic!("expected a contiguous block");
    };
    assert_eq!(block.len(), 4097);
    assert_eq!(addr, block.pfn().phys());
    heap.free(&mut buffer);
    assert_eq!(mem.allocated_pages(), 0);
    Ok(())
}

#[test]
fn test_phys_unsupported_on_page_list() -> anyhow::Result<()> {
    let mem = phys_mem(4, 0)?;
    let heap = sysheap_system::create(mem.clone());
    let buffer = heap.allocate(PAGE_SIZE, 0, 0)?;
    assert!(matches!(heap.phys(&buffer), Err(Error::Unsupported)));
    heap.free(buffer);
    Ok(())
}

#[test]
fn test_concurrent_buffers() -> anyhow::Result<()> {
    let mem = phys_mem(256, 256)?;
    let heap = Arc::new(sysheap_system::create(mem.clone()));
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let heap = heap.clone();
            std::thread::spawn(move || -> sysheap::Result<()> {
                for round in 0..20 {
                    let size = (t + 1) * (round + 1) * 1000;
                    let mut buffer = heap.allocate(size, 0, 0)?;
                    let expected = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
                    assert_eq!(heap.map_dma(&mut buffer)?.total_len(), expected);
                    heap.map_kernel(&mut buffer)?;
                    heap.free(buffer);
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker panicked")?;
    }
    assert_eq!(mem.allocated_pages(), 0);
    Ok(())
}
