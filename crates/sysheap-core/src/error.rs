use thiserror::Error;

/// Errors reported by heap operations.
///
/// Every error is reported synchronously to the immediate caller and never
/// retried internally. Multi-step acquisitions undo their completed steps
/// before returning one of these.
#[derive(Debug, Error)]
pub enum Error {
    /// Acquisition of a page, a block, page-reference storage or a table failed
    #[error("out of memory")]
    OutOfMemory,
    /// The request does not fit the buffer, region or physical memory it targets
    #[error("invalid argument")]
    InvalidArgument,
    /// The page at `index` could not be resolved to a physical frame
    #[error("cannot translate page {index} to a physical frame")]
    Translation {
        /// Position of the page in the buffer
        index: usize,
    },
    /// The buffer has no backing memory
    #[error("buffer is not allocated")]
    NotAllocated,
    /// The buffer is backed by memory of another heap strategy
    #[error("buffer memory does not belong to this heap type")]
    WrongMemoryKind,
    /// The heap does not implement this operation
    #[error("operation not supported by this heap")]
    Unsupported,
    /// The host refused to create or change a mapping
    #[error(transparent)]
    Map(#[from] std::io::Error),
}

/// Result type for heap operations.
pub type Result<T> = std::result::Result<T, Error>;
