//! # Flux Dispatch
//!
//! The consumer side of the readout process: grouping equipment output
//! into per-(timeframe, link) datasets, building subtimeframe messages
//! with heartbeat-frame repacking, and handing them to the downstream
//! transport through a worker pool that preserves timeframe ordering on
//! egress.

pub mod accounting;
pub mod aggregator;
pub mod dataset;
pub mod dispatcher;
pub mod error;
pub mod transport;

pub use aggregator::DataAggregator;
pub use dataset::DataSet;
pub use dispatcher::{DispatcherOptions, DispatcherStats, StfDispatcher};
pub use error::DispatchError;
pub use transport::{
    ChannelTransport, MessagePart, MessageTransport, NullTransport, TransportMessage,
    UnmanagedRegion,
};
