//! Counters and process-wide statistics.
//!
//! [`CounterStats`] tracks a single value series with O(1) min/max/avg,
//! for single-owner use (per-thread stats, repack sizes). Cross-thread
//! counters are plain atomics: [`EquipmentCounters`] per equipment and the
//! process-wide [`GLOBAL_STATS`], which exists exactly once and is
//! const-initialized before any thread starts.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

// ─── Value-series statistics ────────────────────────────────────────

/// O(1) statistics over a series of values. No allocation, single owner.
#[derive(Debug, Clone, Copy)]
pub struct CounterStats {
    count: u64,
    sum: u64,
    min: u64,
    max: u64,
    last: u64,
}

impl CounterStats {
    pub const fn new() -> Self {
        Self {
            count: 0,
            sum: 0,
            min: u64::MAX,
            max: 0,
            last: 0,
        }
    }

    /// Record one value.
    #[inline]
    pub fn set(&mut self, value: u64) {
        self.count += 1;
        self.sum += value;
        self.last = value;
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.count
    }

    #[inline]
    pub fn sum(&self) -> u64 {
        self.sum
    }

    #[inline]
    pub fn last(&self) -> u64 {
        self.last
    }

    /// Minimum recorded value (0 when empty).
    #[inline]
    pub fn minimum(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.min
        }
    }

    #[inline]
    pub fn maximum(&self) -> u64 {
        self.max
    }

    /// Average recorded value (0.0 when empty).
    #[inline]
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }
}

impl Default for CounterStats {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Per-equipment counters ─────────────────────────────────────────

/// Shared counters of one readout equipment. The readout thread writes,
/// the control thread reads for periodic and shutdown summaries.
#[derive(Debug)]
pub struct EquipmentCounters {
    /// Loop iterations.
    pub n_loop: AtomicU64,
    /// Iterations that produced and prepared nothing.
    pub n_idle: AtomicU64,
    /// Pages pushed to the output FIFO (or accounted when output is
    /// disabled).
    pub n_blocks_out: AtomicU64,
    /// Payload bytes of those pages.
    pub n_bytes_out: AtomicU64,
    /// Iterations cut short by a full output FIFO.
    pub n_output_full: AtomicU64,
    /// Iterations skipped by the rate limiter.
    pub n_throttle: AtomicU64,
    /// Pages whose first RDH failed validation.
    pub rdh_check_err: AtomicU64,
    /// Pages whose RDH chain walk was aborted.
    pub rdh_stream_err: AtomicU64,
    /// Highest output-FIFO occupancy observed.
    pub fifo_occupancy_peak: AtomicU64,
}

/// Plain snapshot of [`EquipmentCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EquipmentCountersSnapshot {
    pub n_loop: u64,
    pub n_idle: u64,
    pub n_blocks_out: u64,
    pub n_bytes_out: u64,
    pub n_output_full: u64,
    pub n_throttle: u64,
    pub rdh_check_err: u64,
    pub rdh_stream_err: u64,
    pub fifo_occupancy_peak: u64,
}

impl EquipmentCounters {
    pub const fn new() -> Self {
        Self {
            n_loop: AtomicU64::new(0),
            n_idle: AtomicU64::new(0),
            n_blocks_out: AtomicU64::new(0),
            n_bytes_out: AtomicU64::new(0),
            n_output_full: AtomicU64::new(0),
            n_throttle: AtomicU64::new(0),
            rdh_check_err: AtomicU64::new(0),
            rdh_stream_err: AtomicU64::new(0),
            fifo_occupancy_peak: AtomicU64::new(0),
        }
    }

    pub fn reset(&self) {
        self.n_loop.store(0, Ordering::Relaxed);
        self.n_idle.store(0, Ordering::Relaxed);
        self.n_blocks_out.store(0, Ordering::Relaxed);
        self.n_bytes_out.store(0, Ordering::Relaxed);
        self.n_output_full.store(0, Ordering::Relaxed);
        self.n_throttle.store(0, Ordering::Relaxed);
        self.rdh_check_err.store(0, Ordering::Relaxed);
        self.rdh_stream_err.store(0, Ordering::Relaxed);
        self.fifo_occupancy_peak.store(0, Ordering::Relaxed);
    }

    /// Record an output-FIFO occupancy sample.
    #[inline]
    pub fn record_fifo_occupancy(&self, used: u64) {
        self.fifo_occupancy_peak.fetch_max(used, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EquipmentCountersSnapshot {
        EquipmentCountersSnapshot {
            n_loop: self.n_loop.load(Ordering::Relaxed),
            n_idle: self.n_idle.load(Ordering::Relaxed),
            n_blocks_out: self.n_blocks_out.load(Ordering::Relaxed),
            n_bytes_out: self.n_bytes_out.load(Ordering::Relaxed),
            n_output_full: self.n_output_full.load(Ordering::Relaxed),
            n_throttle: self.n_throttle.load(Ordering::Relaxed),
            rdh_check_err: self.rdh_check_err.load(Ordering::Relaxed),
            rdh_stream_err: self.rdh_stream_err.load(Ordering::Relaxed),
            fifo_occupancy_peak: self.fifo_occupancy_peak.load(Ordering::Relaxed),
        }
    }
}

impl Default for EquipmentCounters {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Process-wide statistics ────────────────────────────────────────

/// Process-wide readout statistics, all atomic.
///
/// Initialized before any equipment starts (const static), torn down
/// never. Signed counters may transiently dip through interleaved
/// inc/dec from different threads but settle at zero when all in-flight
/// pages are released.
#[derive(Debug)]
pub struct ReadoutStats {
    /// Pages currently referenced by in-flight transport messages.
    pub pages_pending: AtomicI64,
    /// In-flight pages released so far.
    pub pages_released: AtomicU64,
    /// Cumulative in-flight time of released pages, microseconds.
    pub pages_pending_time_us: AtomicU64,
    /// Payload bytes currently in flight.
    pub payload_pending_bytes: AtomicI64,
    /// Memory bytes (page capacity) currently in flight.
    pub memory_pending_bytes: AtomicI64,
    /// Bytes handed to the transport.
    pub bytes_sent: AtomicU64,
    /// Last timeframe id handed to the transport.
    pub timeframe_id_sent: AtomicU64,
    /// Heartbeat frames that required a repack copy.
    pub hbf_repacked: AtomicU64,
    /// Bytes copied by repacking.
    pub bytes_copied: AtomicU64,
    /// Update notifications (bumped whenever a field above changes in a
    /// way observers may care about).
    pub notify: AtomicU64,
}

impl ReadoutStats {
    pub const fn new() -> Self {
        Self {
            pages_pending: AtomicI64::new(0),
            pages_released: AtomicU64::new(0),
            pages_pending_time_us: AtomicU64::new(0),
            payload_pending_bytes: AtomicI64::new(0),
            memory_pending_bytes: AtomicI64::new(0),
            bytes_sent: AtomicU64::new(0),
            timeframe_id_sent: AtomicU64::new(0),
            hbf_repacked: AtomicU64::new(0),
            bytes_copied: AtomicU64::new(0),
            notify: AtomicU64::new(0),
        }
    }
}

/// The process-wide statistics block.
pub static GLOBAL_STATS: ReadoutStats = ReadoutStats::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_stats_tracks_min_max_avg() {
        let mut c = CounterStats::new();
        assert_eq!(c.minimum(), 0);
        assert_eq!(c.average(), 0.0);

        for v in [10u64, 2, 8] {
            c.set(v);
        }
        assert_eq!(c.count(), 3);
        assert_eq!(c.minimum(), 2);
        assert_eq!(c.maximum(), 10);
        assert_eq!(c.last(), 8);
        assert!((c.average() - 20.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn equipment_counters_snapshot_and_reset() {
        let c = EquipmentCounters::new();
        c.n_loop.fetch_add(3, Ordering::Relaxed);
        c.record_fifo_occupancy(5);
        c.record_fifo_occupancy(2);

        let snap = c.snapshot();
        assert_eq!(snap.n_loop, 3);
        assert_eq!(snap.fifo_occupancy_peak, 5);

        c.reset();
        assert_eq!(c.snapshot(), EquipmentCountersSnapshot::default());
    }
}
