//! Page-list system heap.
//!
//! This crate provides a heap that assembles each buffer from individually
//! allocated, zero-filled pages. The pages need not be physically contiguous:
//! the heap maps them virtually contiguous for kernel access, inserts them one
//! by one into user address spaces, and describes them to devices with one
//! scatter-gather segment per page.
//!
//! Implements the [`sysheap_core::HeapOps`] trait.

#![warn(missing_docs)]

mod system;

pub use system::{SystemHeap, create, destroy};
