use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

use crate::util::Size;

/// Errors that can occur when loading a [`PhysMemConfig`].
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
}

/// Result type for the config loader.
pub type Result<T> = std::result::Result<T, Error>;

/// Zone layout of a [`PhysMem`](crate::memory::PhysMem) arena.
///
/// ```json
/// { "lowmem_pages": 4096, "highmem_pages": 4096 }
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysMemConfig {
    /// Number of frames with a linear kernel mapping
    pub lowmem_pages: usize,
    /// Number of frames without a linear kernel mapping
    #[serde(default)]
    pub highmem_pages: usize,
}

impl Default for PhysMemConfig {
    fn default() -> Self {
        PhysMemConfig {
            lowmem_pages: 4096,
            highmem_pages: 4096,
        }
    }
}

impl PhysMemConfig {
    /// Creates a layout from zone sizes, rounding each zone up to whole pages.
    pub fn with_sizes(lowmem: Size, highmem: Size) -> Self {
        PhysMemConfig {
            lowmem_pages: lowmem.pages(),
            highmem_pages: highmem.pages(),
        }
    }

    /// Loads configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_jsonfile(filepath: &str) -> Result<PhysMemConfig> {
        let mut file = File::open(Path::new(filepath))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let config: PhysMemConfig = serde_json::from_str(&contents)?;
        Ok(config)
    }
}
