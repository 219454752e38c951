//! Contiguous system heap.
//!
//! This crate provides a heap that backs each buffer with one physically
//! contiguous block of low memory, for devices that cannot do scatter-gather.
//! The block is described by a single scatter-gather segment, mapped into user
//! space as one physical range, and reached by the kernel through the linear
//! mapping.
//!
//! Implements the [`sysheap_core::HeapOps`] trait.

#![warn(missing_docs)]

mod contig;

pub use contig::{ContigHeap, create, destroy};
