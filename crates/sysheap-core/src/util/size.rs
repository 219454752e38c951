use crate::util::n_pages;

/// Memory size representation supporting common units.
///
/// All units use binary (base-2) multipliers (1 KB = 1024 bytes).
///
/// # Examples
///
/// ```
/// use sysheap_core::util::Size;
///
/// let size = Size::MB(4);
/// assert_eq!(size.bytes(), 4 * 1024 * 1024);
/// assert_eq!(size.pages(), 1024);
///
/// let odd = Size::B(4097);
/// assert_eq!(odd.pages(), 2);
/// ```
#[derive(Clone, Copy, Debug)]
pub enum Size {
    /// Size in bytes
    B(usize),
    /// Size in kilobytes (1 KB = 1024 bytes)
    KB(usize),
    /// Size in megabytes (1 MB = 1024 KB)
    MB(usize),
    /// Size in gigabytes (1 GB = 1024 MB)
    GB(usize),
}

impl Size {
    /// Converts this size to bytes, saturating at `usize::MAX`.
    pub const fn bytes(&self) -> usize {
        match self {
            Size::B(bytes) => *bytes,
            Size::KB(kb) => kb.saturating_mul(1 << 10),
            Size::MB(mb) => mb.saturating_mul(1 << 20),
            Size::GB(gb) => gb.saturating_mul(1 << 30),
        }
    }

    /// Number of pages needed to back this size.
    ///
    /// Saturates at `usize::MAX` pages for sizes that cannot be page aligned.
    pub const fn pages(&self) -> usize {
        match n_pages(self.bytes()) {
            Some(pages) => pages,
            None => usize::MAX,
        }
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Size::B(bytes) => write!(f, "{} B", bytes),
            Size::KB(kb) => write!(f, "{} KB", kb),
            Size::MB(mb) => write!(f, "{} MB", mb),
            Size::GB(gb) => write!(f, "{} GB", gb),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::util::{PAGE_SIZE, Size};

    #[test]
    fn size_conversions() {
        let bytes = Size::B(12);
        assert_eq!(bytes.bytes(), 12);
        assert_eq!(bytes.pages(), 1);
        let mb = Size::MB(12);
        assert_eq!(mb.bytes(), 12 * (1 << 20));
        assert_eq!(mb.pages(), 12 * (1 << 20) / PAGE_SIZE);
        assert_eq!(Size::B(0).pages(), 0);
        assert_eq!(Size::GB(usize::MAX).bytes(), usize::MAX);
        assert_eq!(Size::GB(usize::MAX).pages(), usize::MAX);
    }
}
