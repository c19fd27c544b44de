//! Error types for aggregation and dispatch.

use flux_common::resources::ResourceError;
use flux_memory::MemoryError;
use thiserror::Error;

/// Errors raised while building or sending subtimeframe messages.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Pool exhausted while formatting a message.
    #[error("no page left in pool")]
    NoPageLeft,

    /// A repacked heartbeat frame does not fit in one pool page.
    #[error("page size {page_size} too small for {required} bytes")]
    PageTooSmall {
        /// Usable page bytes.
        page_size: usize,
        /// Bytes needed.
        required: usize,
    },

    /// The transport cannot create zero-copy regions.
    #[error("transport '{transport}' does not support unmanaged regions")]
    RegionUnsupported {
        /// Transport name.
        transport: &'static str,
    },

    /// Region creation failed at the OS level.
    #[error("region setup failed: {source}")]
    Region {
        /// Underlying errno.
        source: nix::errno::Errno,
    },

    /// Vectored send failed.
    #[error("transport send failed: {reason}")]
    SendFailed {
        /// Transport-provided reason.
        reason: String,
    },

    /// A formatting-thread input queue was full; the timeframe was
    /// dropped.
    #[error("formatting pipeline full, dropping timeframe {timeframe_id}")]
    PipelineFull {
        /// Dropped timeframe id.
        timeframe_id: u64,
    },

    /// A dataset carried pages of two different timeframes.
    #[error("dataset mixes timeframes {first} and {last}")]
    MixedTimeframes {
        /// Timeframe of the first page.
        first: u64,
        /// Timeframe of the last page.
        last: u64,
    },

    /// Memory system failure.
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// Pre-region resource verification failed.
    #[error(transparent)]
    Resources(#[from] ResourceError),

    /// Construction-time configuration problem.
    #[error("configuration error: {0}")]
    Config(String),
}
