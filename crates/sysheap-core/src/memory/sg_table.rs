use itertools::Itertools;
use log::{log, trace};
use serde::Serialize;

use super::{Pfn, PhysAddr};
use crate::error::{Error, Result};

/// One segment of a scatter-gather table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SgEntry {
    pfn: Pfn,
    length: usize,
    offset: usize,
}

impl SgEntry {
    /// Creates a segment of `length` bytes starting `offset` bytes into frame `pfn`.
    pub fn new(pfn: Pfn, length: usize, offset: usize) -> Self {
        SgEntry {
            pfn,
            length,
            offset,
        }
    }

    /// First frame of the segment.
    pub fn pfn(&self) -> Pfn {
        self.pfn
    }

    /// Segment length in bytes.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Byte offset into the first frame.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Physical address of the first byte of the segment.
    pub fn phys(&self) -> PhysAddr {
        self.pfn.phys() + self.offset
    }

    /// Bus address a device uses to reach the segment.
    ///
    /// Devices see physical memory one-to-one, there is no IOMMU in between.
    pub fn dma_address(&self) -> PhysAddr {
        self.phys()
    }
}

/// Scatter-gather table describing a buffer to a DMA-capable device.
///
/// A table is built fresh for every DMA mapping and owns only its segment
/// descriptors; dropping it never releases the memory it describes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SgTable {
    orig_nents: usize,
    entries: Vec<SgEntry>,
}

impl SgTable {
    /// Allocates an empty table with room for exactly `nents` segments.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the segment storage cannot be reserved.
    pub fn alloc(nents: usize) -> Result<Self> {
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(nents)
            .map_err(|_| Error::OutOfMemory)?;
        Ok(SgTable {
            orig_nents: nents,
            entries,
        })
    }

    /// Appends the next segment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if all `nents` segments are already set.
    pub fn push(&mut self, entry: SgEntry) -> Result<()> {
        if self.entries.len() == self.orig_nents {
            return Err(Error::InvalidArgument);
        }
        trace!(
            "sg[{}] = {:?} len 0x{:x} off 0x{:x}",
            self.entries.len(),
            entry.pfn,
            entry.length,
            entry.offset
        );
        self.entries.push(entry);
        Ok(())
    }

    /// Number of segments set so far.
    pub fn nents(&self) -> usize {
        self.entries.len()
    }

    /// Number of segments the table was allocated for.
    pub fn orig_nents(&self) -> usize {
        self.orig_nents
    }

    /// Returns `true` if every allocated segment has been set.
    pub fn is_complete(&self) -> bool {
        self.entries.len() == self.orig_nents
    }

    /// Sum of all segment lengths.
    pub fn total_len(&self) -> usize {
        self.entries.iter().map(SgEntry::length).sum()
    }

    /// Iterates over the segments in order.
    pub fn iter(&self) -> std::slice::Iter<'_, SgEntry> {
        self.entries.iter()
    }

    /// The segments in order.
    pub fn entries(&self) -> &[SgEntry] {
        &self.entries
    }

    /// Formats the segments for display, one per line.
    pub fn format_segments(&self) -> String {
        self.entries
            .iter()
            .map(|entry| {
                format!(
                    "{:p}..[{:04} KB]..{:p}",
                    entry.phys(),
                    entry.length / 1024,
                    entry.phys() + entry.length
                )
            })
            .join("\n")
    }

    /// Logs the segments at the specified log level.
    pub fn log_segments(&self, level: log::Level) {
        log!(level, "SG table ({} segments):\n{}", self.nents(), self.format_segments());
    }
}

impl<'a> IntoIterator for &'a SgTable {
    type Item = &'a SgEntry;
    type IntoIter = std::slice::Iter<'a, SgEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
