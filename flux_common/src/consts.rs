//! Process-wide constants.

/// Sentinel timeframe id carried by pages before identification.
/// Real timeframe ids are 1-based.
pub const UNDEFINED_TIMEFRAME_ID: u64 = 0;

/// Sentinel equipment id. CRU-derived ids (`cru * 10 + endpoint`) of zero
/// are treated as undefined.
pub const UNDEFINED_EQUIPMENT_ID: u16 = 0;

/// Default timeframe length, in orbits.
pub const DEFAULT_TF_PERIOD_ORBITS: u32 = 256;

/// LHC orbit frequency, in Hz. Drives the software timeframe clock when
/// no RDH stream is available.
pub const LHC_ORBIT_RATE_HZ: f64 = 11_245.0;

/// Default alignment of a pool's slice within its memory bank.
pub const DEFAULT_BLOCK_ALIGN: usize = 2 * 1024 * 1024;

/// Upper bound on blocks read per loop iteration when no rate limit is
/// set, so the control steps of the loop still run regularly.
pub const MAX_BLOCKS_PER_ITERATION: usize = 1024;

/// Sleep applied by dispatcher worker/sender threads when a queue is
/// empty or full, in microseconds.
pub const WORKER_SLEEP_US: u64 = 1000;
