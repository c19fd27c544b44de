//! Error types for the readout pipeline.

use flux_memory::MemoryError;
use thiserror::Error;

use crate::equipment::EquipmentState;

/// Errors raised while building or controlling an equipment.
#[derive(Debug, Error)]
pub enum ReadoutError {
    /// Construction-time configuration problem.
    #[error("configuration error: {0}")]
    Config(String),

    /// Memory system failure (pool carving, bank lookup).
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// The data source refused to initialize.
    #[error("source init failed for {name}: {reason}")]
    SourceInit {
        /// Equipment name.
        name: String,
        /// Source-provided reason.
        reason: String,
    },

    /// Lifecycle method called in the wrong state.
    #[error("{name}: invalid state transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// Equipment name.
        name: String,
        /// Current state.
        from: EquipmentState,
        /// Requested state.
        to: EquipmentState,
    },

    /// I/O failure (file player).
    #[error("i/o error: {source}")]
    Io {
        /// Underlying error.
        #[from]
        source: std::io::Error,
    },
}
