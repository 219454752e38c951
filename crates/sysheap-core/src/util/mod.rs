//! Utility functions and types used throughout sysheap.
//!
//! This module provides:
//! - [`Size`] - Memory size representation
//! - Page constants and rounding helpers ([`PAGE_SIZE`], [`n_pages`], ...)
//! - Thin wrappers around the host's `mmap` family used by the mapping layer

mod constants;
mod mmap;
mod size;

pub use self::constants::*;
pub(crate) use self::mmap::{map_fixed_shared, munmap, reserve_va};
pub use self::size::Size;
