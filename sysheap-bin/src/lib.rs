//! # Sysheap tools
//!
//! Command line helpers shared by the sysheap binaries.
//!
//! ## Binaries
//!
//! - `eval_heap`: exercises a heap end to end (allocate, build the
//!   scatter-gather table, kernel and user mappings, free) and reports
//!   per-attempt results, optionally as JSON.
//!
//! Log output goes through `env_logger` and is routed around progress bars
//! with `indicatif-log-bridge`. Set `RUST_LOG` to adjust verbosity.
use std::sync::Arc;

use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;
use sysheap_core::memory::PhysMem;
use sysheap_core::util::Size;
use sysheap_core::{Heap, PhysMemConfig};

/// Install the global logger so that log lines do not tear `indicatif` bars.
pub fn init_logging_with_progress() -> anyhow::Result<MultiProgress> {
    let logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).build();
    let progress = MultiProgress::new();
    LogWrapper::new(progress.clone(), logger).try_init()?;
    Ok(progress)
}

/// Load the arena configuration from `config`, or build an arena of the given
/// zone sizes when no file is given.
pub fn load_phys_mem(
    config: Option<&str>,
    lowmem: Size,
    highmem: Size,
) -> anyhow::Result<Arc<PhysMem>> {
    let config = match config {
        Some(path) => PhysMemConfig::from_jsonfile(path)?,
        None => PhysMemConfig::with_sizes(lowmem, highmem),
    };
    log::info!(
        "Physical arena: {} lowmem pages, {} highmem pages",
        config.lowmem_pages,
        config.highmem_pages
    );
    Ok(Arc::new(PhysMem::new(&config)?))
}

/// Create a heap by its command line name.
pub fn create_heap(name: &str, mem: Arc<PhysMem>) -> anyhow::Result<Heap> {
    match name {
        "system" => Ok(sysheap_system::create(mem)),
        "contig" | "system_contig" => Ok(sysheap_contig::create(mem)),
        _ => anyhow::bail!("Unknown heap: {}", name),
    }
}
