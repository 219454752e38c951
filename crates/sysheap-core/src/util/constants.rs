/// Page shift value (12 bits) for 4KB pages
pub const PAGE_SHIFT: usize = 12;
/// Standard page size (4096 bytes)
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Mask for extracting page offset
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Rounds `size` up to the next page boundary.
///
/// Returns `None` if the rounded size does not fit in a `usize`.
pub const fn page_align(size: usize) -> Option<usize> {
    match size.checked_add(PAGE_MASK) {
        Some(end) => Some(end & !PAGE_MASK),
        None => None,
    }
}

/// Number of pages needed to back `size` bytes, i.e. `ceil(size / PAGE_SIZE)`.
///
/// Returns `None` on overflow.
pub const fn n_pages(size: usize) -> Option<usize> {
    match page_align(size) {
        Some(aligned) => Some(aligned >> PAGE_SHIFT),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_n_pages() {
        assert_eq!(n_pages(0), Some(0));
        assert_eq!(n_pages(1), Some(1));
        assert_eq!(n_pages(PAGE_SIZE), Some(1));
        assert_eq!(n_pages(PAGE_SIZE + 1), Some(2));
        assert_eq!(n_pages(3 * PAGE_SIZE), Some(3));
    }

    #[test]
    fn test_page_align_overflow() {
        assert_eq!(page_align(usize::MAX), None);
        assert_eq!(n_pages(usize::MAX - PAGE_MASK + 1), None);
        assert_eq!(page_align(usize::MAX - PAGE_MASK), Some(usize::MAX - PAGE_MASK));
    }
}
