//! # Flux Readout
//!
//! The producer side of the readout process: the equipment abstraction,
//! the rate-limited readout thread that tags and pushes pages, RDH chain
//! checking, timeframe identification and the bounded page FIFO feeding
//! the aggregation stage.
//!
//! One equipment = one data source (typically one DMA endpoint) + one
//! dedicated readout thread + one page pool + one output FIFO.

pub mod equipment;
pub mod error;
pub mod fifo;
pub mod rate;
pub mod rdh_check;
pub mod sources;
pub mod tf;

pub use equipment::{EquipmentSource, EquipmentState, ReadoutEquipment, SourceStatus};
pub use error::ReadoutError;
pub use fifo::PageFifo;
pub use rate::{RunClock, TickClock};
