//! Readout equipment: one data source, one pool, one readout thread.
//!
//! The equipment owns the per-iteration production loop: rate limiting,
//! page acquisition through the source, RDH processing, header tagging
//! (equipment id, block id, run number, timeframe id) and the push into
//! the output FIFO. The owning control thread drives the state machine
//! `Created → Started → DataOn ↔ DataOff → Stopped`; only flags cross
//! into the readout thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use flux_common::config::{EquipmentConfig, GlobalConfig};
use flux_common::consts::{
    MAX_BLOCKS_PER_ITERATION, UNDEFINED_EQUIPMENT_ID, UNDEFINED_TIMEFRAME_ID,
};
use flux_common::datablock::DATA_BLOCK_HEADER_SIZE;
use flux_common::rdh::equipment_id_from_cru;
use flux_common::stats::{EquipmentCounters, EquipmentCountersSnapshot};
use flux_common::throttle::LogThrottle;
use flux_common::units::{format_bytes, parse_byte_size};
use flux_memory::{MemoryBankManager, PagedPool, PageRef};
use tracing::{info, warn};

use crate::error::ReadoutError;
use crate::fifo::PageFifo;
use crate::rate::{RunClock, TickClock};
use crate::rdh_check::{first_rdh_info, RdhChecker};
use crate::tf::{OrbitTfTracker, SoftwareTfClock};

/// Result of one `prepare_blocks` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    /// Work was done; keep the loop hot.
    Ok,
    /// Nothing to do right now.
    Idle,
    /// Unrecoverable source failure.
    Error,
}

/// Equipment lifecycle states. Transitions are driven by the owning
/// control thread only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EquipmentState {
    Created,
    Started,
    DataOn,
    DataOff,
    Stopped,
}

/// Interface of a concrete data source behind a readout equipment.
///
/// # Lifecycle
///
/// 1. `init()` — once, before the readout thread starts; the source
///    keeps the pool handle it needs for page acquisition.
/// 2. `next_block()` / `prepare_blocks()` — every loop iteration, on the
///    readout thread.
///
/// `next_block` returns fully prepared pages: payload written,
/// `data_size` and `is_rdh_format` set. The common loop owns all other
/// header tagging.
pub trait EquipmentSource: Send {
    /// Source kind, e.g. `"dummy"`, `"player"`, `"emulator"`.
    fn kind(&self) -> &'static str;

    /// One-time initialization with the equipment's page pool.
    fn init(&mut self, pool: &Arc<PagedPool>) -> Result<(), ReadoutError>;

    /// Hand over the next prepared page, or `None` when nothing is
    /// ready (pool empty, end of data, hardware idle).
    fn next_block(&mut self) -> Option<PageRef>;

    /// Refill internal queues. Default: nothing to prepare.
    fn prepare_blocks(&mut self) -> SourceStatus {
        SourceStatus::Idle
    }

    /// Bytes of source-internal buffering, for memory usage summaries.
    fn memory_usage(&self) -> usize {
        0
    }
}

/// Runtime options of one equipment, resolved from configuration.
#[derive(Debug, Clone)]
pub struct EquipmentOptions {
    pub name: String,
    /// Configured equipment id; overrides any RDH-derived id when
    /// nonzero.
    pub id: u16,
    /// Target block rate in Hz, <= 0 for unlimited.
    pub readout_rate: f64,
    pub idle_sleep: Duration,
    pub disable_output: bool,
    pub rdh_check_enabled: bool,
    pub rdh_dump_enabled: bool,
    pub rdh_use_first_in_page: bool,
    pub tf_period: u32,
    pub stop_on_error: bool,
    pub debug_first_pages: u64,
    pub console_stats_update: Option<Duration>,
    pub run_number: u64,
}

impl EquipmentOptions {
    /// Resolve options from the configuration sections.
    pub fn from_config(cfg: &EquipmentConfig, global: &GlobalConfig, index: usize) -> Self {
        Self {
            name: cfg
                .name
                .clone()
                .unwrap_or_else(|| format!("equipment-{index}")),
            id: cfg.id,
            readout_rate: cfg.rate.unwrap_or(global.rate),
            idle_sleep: Duration::from_micros(cfg.idle_sleep_time_us as u64),
            disable_output: cfg.disable_output,
            rdh_check_enabled: cfg.rdh_check_enabled,
            rdh_dump_enabled: cfg.rdh_dump_enabled,
            rdh_use_first_in_page: cfg.rdh_use_first_in_page_enabled,
            tf_period: cfg.tf_period,
            stop_on_error: cfg.stop_on_error,
            debug_first_pages: cfg.debug_first_pages,
            console_stats_update: (cfg.console_stats_update_time_s > 0.0)
                .then(|| Duration::from_secs_f64(cfg.console_stats_update_time_s)),
            run_number: global.run_number,
        }
    }
}

/// A readout equipment: producer pipeline from one source to one FIFO.
pub struct ReadoutEquipment {
    opts: EquipmentOptions,
    pool: Arc<PagedPool>,
    fifo: Arc<PageFifo>,
    counters: Arc<EquipmentCounters>,
    shutdown: Arc<AtomicBool>,
    data_on: Arc<AtomicBool>,
    state: EquipmentState,
    source: Option<Box<dyn EquipmentSource>>,
    thread: Option<JoinHandle<()>>,
    run_clock: RunClock,
}

impl ReadoutEquipment {
    /// Build an equipment: carve its page pool, size its FIFO, keep the
    /// source for `start()`.
    pub fn new(
        cfg: &EquipmentConfig,
        global: &GlobalConfig,
        manager: &MemoryBankManager,
        source: Box<dyn EquipmentSource>,
        index: usize,
    ) -> Result<Self, ReadoutError> {
        let opts = EquipmentOptions::from_config(cfg, global, index);

        let page_size = parse_byte_size(&cfg.memory_pool_page_size)
            .ok_or_else(|| {
                ReadoutError::Config(format!(
                    "{}: bad memory_pool_page_size '{}'",
                    opts.name, cfg.memory_pool_page_size
                ))
            })? as usize;
        let page_count = cfg.memory_pool_number_of_pages;

        let cfg_first_offset = parse_byte_size(&cfg.first_page_offset).ok_or_else(|| {
            ReadoutError::Config(format!(
                "{}: bad first_page_offset '{}'",
                opts.name, cfg.first_page_offset
            ))
        })? as usize;
        let block_align = parse_byte_size(&cfg.block_align).ok_or_else(|| {
            ReadoutError::Config(format!(
                "{}: bad block_align '{}'",
                opts.name, cfg.block_align
            ))
        })? as usize;

        // Align the payload of the first page: by default it starts one
        // page into the slice (header just in front of it); an explicit
        // offset names where that payload should land.
        if page_size <= DATA_BLOCK_HEADER_SIZE {
            return Err(ReadoutError::Config(format!(
                "{}: page size {page_size} does not fit the page header",
                opts.name
            )));
        }
        let first_page_offset = if cfg_first_offset == 0 {
            page_size - DATA_BLOCK_HEADER_SIZE
        } else {
            cfg_first_offset.checked_sub(DATA_BLOCK_HEADER_SIZE).ok_or_else(|| {
                ReadoutError::Config(format!(
                    "{}: first_page_offset {cfg_first_offset} smaller than the page header",
                    opts.name
                ))
            })?
        };

        info!(
            equipment = %opts.name,
            rate = opts.readout_rate,
            idle_sleep_us = opts.idle_sleep.as_micros() as u64,
            page_size,
            page_count,
            bank = %cfg.memory_bank_name,
            "creating equipment"
        );

        let pool = manager.get_paged_pool(
            page_size,
            page_count,
            &cfg.memory_bank_name,
            first_page_offset,
            block_align,
        )?;

        let pool_throttle = LogThrottle::new(Duration::from_secs(10));
        let pool_name = opts.name.clone();
        pool.set_warning_callback(Box::new(move |msg| {
            if let Some(suppressed) = pool_throttle.allow() {
                warn!(equipment = %pool_name, suppressed, "{msg}");
            }
        }));

        let fifo_size = if cfg.output_fifo_size < 0 {
            page_count
        } else {
            cfg.output_fifo_size as usize
        };
        if fifo_size == 0 {
            return Err(ReadoutError::Config(format!(
                "{}: output FIFO size is zero",
                opts.name
            )));
        }

        if opts.disable_output {
            info!(equipment = %opts.name, "output disabled, data will be dropped after readout");
        }

        Ok(Self {
            opts,
            pool,
            fifo: Arc::new(PageFifo::new(fifo_size)),
            counters: Arc::new(EquipmentCounters::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            data_on: Arc::new(AtomicBool::new(false)),
            state: EquipmentState::Created,
            source: Some(source),
            thread: None,
            run_clock: RunClock::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.opts.name
    }

    pub fn state(&self) -> EquipmentState {
        self.state
    }

    /// The FIFO consumed by the aggregation stage.
    pub fn output(&self) -> Arc<PageFifo> {
        Arc::clone(&self.fifo)
    }

    pub fn counters(&self) -> Arc<EquipmentCounters> {
        Arc::clone(&self.counters)
    }

    pub fn pool(&self) -> &Arc<PagedPool> {
        &self.pool
    }

    /// Start the readout thread. Data only flows after `set_data_on`.
    pub fn start(&mut self) -> Result<(), ReadoutError> {
        if self.state != EquipmentState::Created {
            return Err(ReadoutError::InvalidTransition {
                name: self.opts.name.clone(),
                from: self.state,
                to: EquipmentState::Started,
            });
        }

        let mut source = self.source.take().expect("source present in Created state");
        source.init(&self.pool)?;
        info!(
            equipment = %self.opts.name,
            source = source.kind(),
            source_memory = source.memory_usage(),
            "source initialized"
        );

        self.counters.reset();
        self.shutdown.store(false, Ordering::SeqCst);
        self.run_clock.reset();

        let tick_interval_us = if self.opts.readout_rate > 0.0 {
            1e6 / self.opts.readout_rate
        } else {
            0.0
        };

        let mut rl = ReadoutLoop {
            opts: self.opts.clone(),
            source,
            fifo: Arc::clone(&self.fifo),
            counters: Arc::clone(&self.counters),
            shutdown: Arc::clone(&self.shutdown),
            data_on: Arc::clone(&self.data_on),
            run_clock: self.run_clock,
            tick: TickClock::new(tick_interval_us),
            sw_clock: SoftwareTfClock::new(self.opts.tf_period),
            orbit_tracker: OrbitTfTracker::new(self.opts.tf_period),
            checker: RdhChecker::new(self.opts.rdh_dump_enabled),
            rdh_throttle: LogThrottle::new(Duration::from_secs(10)),
            error_throttle: LogThrottle::new(Duration::from_secs(10)),
            current_block_id: 0,
            debug_pages_remaining: self.opts.debug_first_pages,
            console: self.opts.console_stats_update.map(|interval| ConsoleStats {
                interval,
                next: Instant::now() + interval,
                last: EquipmentCountersSnapshot::default(),
            }),
        };

        let handle = std::thread::Builder::new()
            .name(format!("readout-{}", self.opts.name))
            .spawn(move || rl.run())?;
        self.thread = Some(handle);
        self.state = EquipmentState::Started;
        info!(equipment = %self.opts.name, "equipment started");
        Ok(())
    }

    pub fn set_data_on(&mut self) -> Result<(), ReadoutError> {
        match self.state {
            EquipmentState::Started | EquipmentState::DataOff => {
                self.data_on.store(true, Ordering::SeqCst);
                self.state = EquipmentState::DataOn;
                Ok(())
            }
            from => Err(ReadoutError::InvalidTransition {
                name: self.opts.name.clone(),
                from,
                to: EquipmentState::DataOn,
            }),
        }
    }

    pub fn set_data_off(&mut self) -> Result<(), ReadoutError> {
        match self.state {
            EquipmentState::DataOn => {
                self.data_on.store(false, Ordering::SeqCst);
                self.state = EquipmentState::DataOff;
                Ok(())
            }
            from => Err(ReadoutError::InvalidTransition {
                name: self.opts.name.clone(),
                from,
                to: EquipmentState::DataOff,
            }),
        }
    }

    /// Stop the readout thread and log the run summary.
    pub fn stop(&mut self) -> Result<(), ReadoutError> {
        match self.state {
            EquipmentState::Started | EquipmentState::DataOn | EquipmentState::DataOff => {}
            from => {
                return Err(ReadoutError::InvalidTransition {
                    name: self.opts.name.clone(),
                    from,
                    to: EquipmentState::Stopped,
                })
            }
        }

        let running_time = self.run_clock.elapsed_secs();
        self.data_on.store(false, Ordering::SeqCst);
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        self.state = EquipmentState::Stopped;

        let s = self.counters.snapshot();
        info!(
            equipment = %self.opts.name,
            n_loop = s.n_loop,
            n_idle = s.n_idle,
            n_blocks_out = s.n_blocks_out,
            n_bytes_out = s.n_bytes_out,
            n_output_full = s.n_output_full,
            n_throttle = s.n_throttle,
            rdh_check_err = s.rdh_check_err,
            rdh_stream_err = s.rdh_stream_err,
            "equipment stopped"
        );
        let active_loops = s.n_loop.saturating_sub(s.n_idle);
        if active_loops > 0 {
            info!(
                equipment = %self.opts.name,
                avg_pages_per_iteration = s.n_blocks_out as f64 / active_loops as f64,
                throughput = %format_bytes(s.n_bytes_out as f64 / running_time.max(1e-9), "B/s"),
                "run summary"
            );
        }
        info!(equipment = %self.opts.name, "{}", self.pool.stats_summary());
        Ok(())
    }
}

impl Drop for ReadoutEquipment {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

enum LoopOutcome {
    Active,
    Idle,
    Error,
}

struct ConsoleStats {
    interval: Duration,
    next: Instant,
    last: EquipmentCountersSnapshot,
}

/// State owned by the readout thread.
struct ReadoutLoop {
    opts: EquipmentOptions,
    source: Box<dyn EquipmentSource>,
    fifo: Arc<PageFifo>,
    counters: Arc<EquipmentCounters>,
    shutdown: Arc<AtomicBool>,
    data_on: Arc<AtomicBool>,
    run_clock: RunClock,
    tick: TickClock,
    sw_clock: SoftwareTfClock,
    orbit_tracker: OrbitTfTracker,
    checker: RdhChecker,
    rdh_throttle: LogThrottle,
    error_throttle: LogThrottle,
    current_block_id: u64,
    debug_pages_remaining: u64,
    console: Option<ConsoleStats>,
}

impl ReadoutLoop {
    fn run(&mut self) {
        while !self.shutdown.load(Ordering::Acquire) {
            match self.iterate() {
                LoopOutcome::Active => {}
                LoopOutcome::Idle => {
                    self.counters.n_idle.fetch_add(1, Ordering::Relaxed);
                    std::thread::sleep(self.opts.idle_sleep);
                }
                LoopOutcome::Error => {
                    if let Some(suppressed) = self.error_throttle.allow() {
                        warn!(equipment = %self.opts.name, suppressed, "source reported an error");
                    }
                    if self.opts.stop_on_error {
                        break;
                    }
                    std::thread::sleep(self.opts.idle_sleep);
                }
            }
        }
    }

    fn iterate(&mut self) -> LoopOutcome {
        self.counters.n_loop.fetch_add(1, Ordering::Relaxed);
        let mut is_active = false;

        // Rate window: how many blocks may still go out in this run.
        let mut max_blocks = MAX_BLOCKS_PER_ITERATION;
        if self.opts.readout_rate > 0.0 {
            let emitted = self.counters.n_blocks_out.load(Ordering::Relaxed);
            let allowed =
                (self.opts.readout_rate * self.run_clock.elapsed_secs()) as i64 - emitted as i64;
            if !self.tick.is_timeout() && emitted != 0 && allowed <= 0 {
                // target rate exceeded, wait for the next tick
                self.counters.n_throttle.fetch_add(1, Ordering::Relaxed);
                return LoopOutcome::Idle;
            }
            max_blocks = allowed.max(0) as usize;
        }

        self.counters.record_fifo_occupancy(self.fifo.len() as u64);

        if self.data_on.load(Ordering::Acquire) {
            let mut pushed = 0u64;
            for _ in 0..max_blocks {
                if self.fifo.is_full() {
                    self.counters.n_output_full.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                let Some(mut page) = self.source.next_block() else {
                    break;
                };

                if page.header().rdh_format() {
                    self.process_rdh_page(&mut page);
                }

                let tf_fallback = self.sw_clock.current_tf();
                let h = page.header_mut();
                if self.opts.id != UNDEFINED_EQUIPMENT_ID {
                    h.equipment_id = self.opts.id;
                }
                self.current_block_id += 1; // ids start at 1
                h.block_id = self.current_block_id;
                h.run_number = self.opts.run_number;
                if h.timeframe_id == UNDEFINED_TIMEFRAME_ID {
                    h.timeframe_id = tf_fallback;
                }
                let bytes = h.data_size as u64;

                if self.debug_pages_remaining > 0 {
                    self.debug_pages_remaining -= 1;
                    info!(
                        equipment = %self.opts.name,
                        block_id = h.block_id,
                        timeframe_id = h.timeframe_id,
                        link_id = h.link_id,
                        data_size = h.data_size,
                        is_rdh = h.is_rdh_format,
                        "page produced"
                    );
                }

                if !self.opts.disable_output {
                    if let Err(page) = self.fifo.push(page) {
                        drop(page);
                        self.counters.n_output_full.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                }

                if self.opts.readout_rate > 0.0 {
                    self.tick.increment();
                }
                pushed += 1;
                self.counters.n_bytes_out.fetch_add(bytes, Ordering::Relaxed);
                is_active = true;
            }
            self.counters.n_blocks_out.fetch_add(pushed, Ordering::Relaxed);
        }

        match self.source.prepare_blocks() {
            SourceStatus::Ok => is_active = true,
            SourceStatus::Idle => {}
            SourceStatus::Error => return LoopOutcome::Error,
        }

        self.emit_console_stats();

        if is_active {
            LoopOutcome::Active
        } else {
            LoopOutcome::Idle
        }
    }

    /// First-RDH tagging plus the optional full chain check.
    fn process_rdh_page(&mut self, page: &mut PageRef) {
        let data_size = (page.header().data_size as usize).min(page.usable_size());
        let info = match first_rdh_info(&page.payload()[..data_size]) {
            Ok(info) => info,
            Err(e) => {
                self.counters.rdh_check_err.fetch_add(1, Ordering::Relaxed);
                if let Some(suppressed) = self.rdh_throttle.allow() {
                    warn!(equipment = %self.opts.name, suppressed, "invalid first RDH: {e}");
                }
                page.header_mut().is_rdh_format = 0;
                return;
            }
        };

        if self.opts.rdh_use_first_in_page {
            let tf = self.orbit_tracker.tf_for_orbit(info.heartbeat_orbit);
            let (orbit_first, orbit_last) = self.orbit_tracker.window(tf);
            let derived_id = equipment_id_from_cru(info.cru_id, info.end_point_id);
            let h = page.header_mut();
            h.link_id = info.link_id;
            h.fee_id = info.fee_id;
            h.system_id = info.system_id;
            if derived_id != UNDEFINED_EQUIPMENT_ID {
                h.equipment_id = derived_id;
            }
            h.timeframe_id = tf;
            h.timeframe_orbit_first = orbit_first;
            h.timeframe_orbit_last = orbit_last;
        }

        if self.opts.rdh_check_enabled {
            let h = page.header();
            let window = (h.timeframe_id != UNDEFINED_TIMEFRAME_ID)
                .then(|| (h.timeframe_orbit_first, h.timeframe_orbit_last));
            let failed = self
                .checker
                .check_page(
                    &self.opts.name,
                    &page.payload()[..data_size],
                    info.link_id,
                    window,
                )
                .is_some();
            if failed {
                self.counters.rdh_stream_err.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn emit_console_stats(&mut self) {
        let Some(console) = &mut self.console else {
            return;
        };
        if Instant::now() < console.next {
            return;
        }
        let now = self.counters.snapshot();
        let prev = console.last;
        info!(
            equipment = %self.opts.name,
            blocks_diff = now.n_blocks_out - prev.n_blocks_out,
            blocks_total = now.n_blocks_out,
            bytes_diff = now.n_bytes_out - prev.n_bytes_out,
            bytes_total = now.n_bytes_out,
            fifo_peak = now.fifo_occupancy_peak,
            "equipment stats"
        );
        console.last = now;
        console.next += console.interval;
    }
}
