//! # Flux Common
//!
//! Shared building blocks for the flux readout process: the in-band
//! DataBlock page header, the RDH (raw data header) wire format, the
//! subtimeframe wire header, byte-unit parsing, process-wide counters,
//! rate-limited logging and TOML configuration.
//!
//! Everything in this crate is transport- and hardware-agnostic; the
//! memory, readout and dispatch crates build on top of it.

pub mod config;
pub mod consts;
pub mod datablock;
pub mod rdh;
pub mod resources;
pub mod stats;
pub mod stf;
pub mod throttle;
pub mod units;

pub use config::{ConfigError, ReadoutConfig};
pub use consts::{
    DEFAULT_TF_PERIOD_ORBITS, LHC_ORBIT_RATE_HZ, UNDEFINED_EQUIPMENT_ID, UNDEFINED_TIMEFRAME_ID,
};
pub use datablock::{DataBlockHeader, DATA_BLOCK_HEADER_SIZE, USER_SPACE_SIZE};
pub use rdh::{RdhError, RdhView, RDH_SIZE};
pub use stats::{CounterStats, EquipmentCounters, ReadoutStats, GLOBAL_STATS};
pub use stf::{StfHeader, STF_HEADER_SIZE};
pub use throttle::LogThrottle;

/// Initialize tracing for the readout process.
///
/// Honors `RUST_LOG`; falls back to `info`. Safe to call more than once
/// (subsequent calls are no-ops).
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
