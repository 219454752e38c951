use std::fmt::{Debug, Formatter};
use std::ops::{Add, Sub};

use crate::util::{PAGE_MASK, PAGE_SHIFT};
use serde::Serialize;

#[repr(transparent)]
#[derive(Clone, Copy, Default, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// Physical memory address.
///
/// A newtype wrapper around a physical address value.
pub struct PhysAddr(usize);

impl Debug for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("PhysAddr(0x{:02x})", self.0))
    }
}

impl PhysAddr {
    /// Creates a new physical address.
    pub fn new(addr: usize) -> Self {
        PhysAddr(addr)
    }

    /// Returns the address as a usize.
    pub fn as_usize(&self) -> usize {
        self.0
    }

    /// Returns the frame containing this address.
    pub fn pfn(&self) -> Pfn {
        Pfn(self.0 >> PAGE_SHIFT)
    }

    /// Returns the byte offset of this address inside its frame.
    pub fn page_offset(&self) -> usize {
        self.0 & PAGE_MASK
    }
}

#[repr(transparent)]
#[derive(Clone, Copy, Default, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// Physical frame number.
///
/// Frame `n` starts at physical address `n << PAGE_SHIFT`.
pub struct Pfn(usize);

impl Debug for Pfn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("Pfn(0x{:x})", self.0))
    }
}

impl Pfn {
    /// Creates a new frame number.
    pub fn new(pfn: usize) -> Self {
        Pfn(pfn)
    }

    /// Returns the frame number as a usize.
    pub fn as_usize(&self) -> usize {
        self.0
    }

    /// Physical address of the first byte of this frame.
    pub fn phys(&self) -> PhysAddr {
        PhysAddr(self.0 << PAGE_SHIFT)
    }
}

impl From<PhysAddr> for usize {
    fn from(addr: PhysAddr) -> usize {
        addr.0
    }
}

impl From<Pfn> for usize {
    fn from(pfn: Pfn) -> usize {
        pfn.0
    }
}

impl std::fmt::Pointer for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:p}", self.0 as *const u8)
    }
}

impl Add<usize> for PhysAddr {
    type Output = PhysAddr;

    fn add(self, rhs: usize) -> Self::Output {
        PhysAddr(self.0 + rhs)
    }
}

impl Sub<PhysAddr> for PhysAddr {
    type Output = usize;

    fn sub(self, rhs: PhysAddr) -> Self::Output {
        assert!(self.0 >= rhs.0);
        self.0 - rhs.0
    }
}

impl Pfn {
    /// `self + rhs`, or `None` on overflow.
    pub const fn checked_add(self, rhs: usize) -> Option<Pfn> {
        match self.0.checked_add(rhs) {
            Some(pfn) => Some(Pfn(pfn)),
            None => None,
        }
    }
}

impl Add<usize> for Pfn {
    type Output = Pfn;

    fn add(self, rhs: usize) -> Self::Output {
        Pfn(self.0 + rhs)
    }
}
