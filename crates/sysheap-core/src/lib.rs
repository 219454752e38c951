//! # Sysheap Core
//!
//! `sysheap-core` is the foundation of the sysheap buffer heaps. A heap backend
//! supplies one allocation strategy behind the uniform [`HeapOps`] operation
//! table consumed by a higher-level allocation framework. For every buffer a
//! heap allocates, it can build a scatter-gather table for DMA-capable devices
//! and map the same memory into kernel space and into a requesting process.
//!
//! ## Architecture Overview
//!
//! - [`HeapOps`] - The operation table: allocate, free, phys, map/unmap for DMA,
//!   kernel and user space. Kernel mappings and DMA unmapping come with shared
//!   default implementations.
//!
//! - [`Heap`] - A heap instance: type tag plus operation table. It forwards
//!   buffer operations and caches the resulting mappings on the [`Buffer`].
//!
//! - [`Buffer`] / [`HeapMemory`] - The framework-owned buffer record and the
//!   per-strategy backing memory it carries.
//!
//! ## Main Components
//!
//! - [`memory`] module - Simulated physical memory ([`memory::PhysMem`]),
//!   page handles, transactional page acquisition, scatter-gather tables, and
//!   kernel and user mappings.
//!
//! - [`util`] module - Page constants and the [`util::Size`] helper.
//!
//! ## Platform Support
//!
//! Physical memory is backed by a `memfd` file and mapped with `mmap`, so the
//! crate targets Linux with 4 KB pages.

#![warn(missing_docs)]

mod buffer;
mod config;
mod error;
pub mod heap;
pub mod memory;
pub mod util;

pub use crate::buffer::{Buffer, HeapMemory};
pub use crate::config::{Error as ConfigError, PhysMemConfig};
pub use crate::error::{Error, Result};
pub use crate::heap::{Heap, HeapOps, HeapType};
