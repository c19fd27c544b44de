//! Error types for the paged memory system.

use thiserror::Error;

/// Errors raised by banks, the bank manager and paged pools.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// A bank with this name is already registered.
    #[error("bank already registered: {name}")]
    BankAlreadyExists {
        /// Bank name.
        name: String,
    },

    /// No bank with this name is registered.
    #[error("bank not found: {name}")]
    BankNotFound {
        /// Bank name.
        name: String,
    },

    /// No registered bank has a contiguous free range of the needed size.
    #[error("no bank has {size} contiguous free bytes (alignment {align})")]
    NoSpace {
        /// Bytes requested (including first page offset).
        size: usize,
        /// Requested slice alignment.
        align: usize,
    },

    /// Pool geometry is unusable.
    #[error("invalid pool geometry: {page_count} pages x {page_size} bytes")]
    InvalidGeometry {
        /// Page size in bytes.
        page_size: usize,
        /// Number of pages.
        page_count: usize,
    },

    /// A size or offset does not satisfy its alignment requirement.
    #[error("{what} {value} is not a multiple of {align}")]
    Misaligned {
        /// Which quantity is misaligned.
        what: &'static str,
        /// Offending value.
        value: usize,
        /// Required alignment.
        align: usize,
    },

    /// Page size too small to hold the in-band header.
    #[error("page size {page_size} smaller than reserved header ({header_size})")]
    PageTooSmall {
        /// Page size in bytes.
        page_size: usize,
        /// Reserved header bytes.
        header_size: usize,
    },

    /// Backing memory mapping failed.
    #[error("memory mapping failed: {source}")]
    Map {
        /// Underlying I/O error.
        #[from]
        source: std::io::Error,
    },
}

/// Result type for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;
