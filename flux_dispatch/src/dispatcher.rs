//! Subtimeframe dispatcher.
//!
//! Consumes per-(timeframe, link) datasets and emits one multi-part
//! message each: an STF header part followed by one part per heartbeat
//! frame. HBFs that straddle page boundaries are repacked into fresh
//! pages so downstream sees contiguous parts; with packed copy enabled
//! one scratch page backs several repacked HBFs through child
//! allocations, which is what keeps the header/repack pool small.
//!
//! With `threads > 0`, whole timeframes are routed round-robin to a pool
//! of formatter threads and a single sender thread drains their output
//! queues in the same round-robin order, so egress stays ordered by
//! timeframe while formatting runs in parallel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use tracing::{info, warn};

use flux_common::config::{DispatcherConfig, OutputFormat};
use flux_common::consts::{UNDEFINED_TIMEFRAME_ID, WORKER_SLEEP_US};
use flux_common::datablock::DATA_BLOCK_HEADER_SIZE;
use flux_common::rdh::{RdhView, RDH_SIZE};
use flux_common::stats::{CounterStats, GLOBAL_STATS};
use flux_common::stf::{StfHeader, STF_HEADER_SIZE};
use flux_common::throttle::LogThrottle;
use flux_memory::{PagedPool, PageRef};

use crate::accounting::{self, TransitGuard};
use crate::dataset::DataSet;
use crate::error::DispatchError;
use crate::transport::{MessagePart, MessageTransport, PartHold};

/// Timeframes buffered for one formatter thread.
type TfBuffer = Vec<DataSet>;

/// Formatted messages of one timeframe, in dataset order.
type MessageBatch = Vec<FormattedStf>;

/// One formatted subtimeframe message, ready to send.
struct FormattedStf {
    tf_id: u64,
    parts: Vec<MessagePart>,
    /// STF header + payload bytes (what the transport accounts).
    total_size: u64,
}

/// Dispatcher options resolved from configuration.
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    pub name: String,
    pub format: OutputFormat,
    pub packed_copy: bool,
    /// Formatter threads; 0 formats and sends inline.
    pub threads: usize,
}

impl DispatcherOptions {
    pub fn from_config(cfg: &DispatcherConfig) -> Result<Self, DispatchError> {
        let format = OutputFormat::from_raw_format(cfg.enable_raw_format)
            .map_err(|e| DispatchError::Config(e.to_string()))?;
        Ok(Self {
            name: "dispatcher".to_string(),
            format,
            packed_copy: cfg.enable_packed_copy,
            threads: cfg.threads,
        })
    }
}

/// Counter snapshot for summaries and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatcherStats {
    pub push_success: u64,
    pub push_error: u64,
    pub tf_non_contiguous: u64,
    pub pages_input: u64,
    pub pages_repack: u64,
    pub repack_count: u64,
    pub repack_avg: f64,
    pub repack_max: u64,
}

struct Counters {
    push_success: AtomicU64,
    push_error: AtomicU64,
    tf_non_contiguous: AtomicU64,
    pages_input: AtomicU64,
    pages_repack: AtomicU64,
    repack_sizes: Mutex<CounterStats>,
}

struct WorkerQueues {
    input: ArrayQueue<TfBuffer>,
    output: ArrayQueue<MessageBatch>,
}

/// State shared between the routing side and the thread pool.
struct Shared {
    opts: DispatcherOptions,
    pool: Arc<PagedPool>,
    transport: Arc<dyn MessageTransport>,
    /// Pool pages live inside a transport-registered region: parts are
    /// zero-copy and carry in-flight accounting.
    region_backed: bool,
    counters: Counters,
    shutdown: AtomicBool,
    workers: Vec<WorkerQueues>,
    page_throttle: LogThrottle,
    mismatch_throttle: LogThrottle,
    drop_throttle: LogThrottle,
    send_throttle: LogThrottle,
}

/// Per-dataset repack state while cutting pages into heartbeat frames.
struct RepackState {
    /// Current scratch page for packed copies.
    scratch: Option<PageRef>,
    last_hb: Option<u32>,
    pending: Vec<PendingFrame>,
}

/// One HBF fragment awaiting collapse.
struct PendingFrame {
    page: PageRef,
    start: usize,
    len: usize,
}

/// Routing state owned by the pushing thread.
struct RouteState {
    current_tf: u64,
    buffer: TfBuffer,
    next_worker: usize,
}

/// The subtimeframe dispatcher.
pub struct StfDispatcher {
    shared: Arc<Shared>,
    route: Mutex<RouteState>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    sender_handle: Mutex<Option<JoinHandle<()>>>,
}

impl StfDispatcher {
    /// Build the dispatcher and start its thread pool (if configured).
    ///
    /// `region_backed` states that `pool` was carved from a
    /// transport-registered region, enabling zero-copy accounting.
    pub fn new(
        opts: DispatcherOptions,
        pool: Arc<PagedPool>,
        transport: Arc<dyn MessageTransport>,
        region_backed: bool,
    ) -> Self {
        let threads = opts.threads;
        // about one second of timeframes across the pool
        let worker_fifo_size = if threads > 0 { (88 / threads).max(1) } else { 0 };

        let workers = (0..threads)
            .map(|_| WorkerQueues {
                input: ArrayQueue::new(worker_fifo_size),
                output: ArrayQueue::new(worker_fifo_size),
            })
            .collect();

        info!(
            dispatcher = %opts.name,
            format = ?opts.format,
            packed_copy = opts.packed_copy,
            threads,
            region_backed,
            "creating dispatcher"
        );

        let shared = Arc::new(Shared {
            opts,
            pool,
            transport,
            region_backed,
            counters: Counters {
                push_success: AtomicU64::new(0),
                push_error: AtomicU64::new(0),
                tf_non_contiguous: AtomicU64::new(0),
                pages_input: AtomicU64::new(0),
                pages_repack: AtomicU64::new(0),
                repack_sizes: Mutex::new(CounterStats::new()),
            },
            shutdown: AtomicBool::new(false),
            workers,
            page_throttle: LogThrottle::new(Duration::from_secs(10)),
            mismatch_throttle: LogThrottle::new(Duration::from_secs(10)),
            drop_throttle: LogThrottle::new(Duration::from_secs(10)),
            send_throttle: LogThrottle::new(Duration::from_secs(10)),
        });

        let mut worker_handles = Vec::with_capacity(threads);
        for ix in 0..threads {
            let shared_w = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("{}-w-{ix}", shared.opts.name))
                .spawn(move || worker_loop(shared_w, ix))
                .expect("spawn formatter thread");
            worker_handles.push(handle);
        }
        let sender_handle = (threads > 0).then(|| {
            let shared_s = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("{}-s", shared.opts.name))
                .spawn(move || sender_loop(shared_s))
                .expect("spawn sender thread")
        });

        Self {
            shared,
            route: Mutex::new(RouteState {
                current_tf: UNDEFINED_TIMEFRAME_ID,
                buffer: Vec::new(),
                next_worker: 0,
            }),
            worker_handles: Mutex::new(worker_handles),
            sender_handle: Mutex::new(sender_handle),
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        let c = &self.shared.counters;
        let repack = c.repack_sizes.lock();
        DispatcherStats {
            push_success: c.push_success.load(Ordering::Relaxed),
            push_error: c.push_error.load(Ordering::Relaxed),
            tf_non_contiguous: c.tf_non_contiguous.load(Ordering::Relaxed),
            pages_input: c.pages_input.load(Ordering::Relaxed),
            pages_repack: c.pages_repack.load(Ordering::Relaxed),
            repack_count: repack.count(),
            repack_avg: repack.average(),
            repack_max: repack.maximum(),
        }
    }

    pub fn pool(&self) -> &Arc<PagedPool> {
        &self.shared.pool
    }

    /// Dispatch one dataset. Errors are already counted and logged; the
    /// result is surfaced for callers that want to stop on error.
    pub fn push_dataset(&self, ds: DataSet) -> Result<(), DispatchError> {
        if ds.is_empty() {
            return Ok(());
        }
        self.shared
            .counters
            .pages_input
            .fetch_add(ds.len() as u64, Ordering::Relaxed);

        match self.shared.opts.format {
            OutputFormat::Raw => self.shared.send_raw(ds),
            OutputFormat::RawDatablock => self.shared.send_raw_datablock(ds),
            OutputFormat::StfSuperpage => self.shared.send_stf_superpage(ds),
            OutputFormat::StfHbf => {
                if ds.pages[0].header().rdh_format() {
                    self.route_stf_hbf(ds)
                } else {
                    // non-RDH payloads cannot be cut into HBFs
                    self.shared.send_stf_superpage(ds)
                }
            }
        }
    }

    /// STF/HBF path: inline, or buffered per timeframe and routed
    /// round-robin to the formatter pool.
    fn route_stf_hbf(&self, ds: DataSet) -> Result<(), DispatchError> {
        if let Err(e) = ds.check_single_timeframe() {
            self.shared.count_error();
            if let Some(suppressed) = self.shared.mismatch_throttle.allow() {
                warn!(dispatcher = %self.shared.opts.name, suppressed, "{e}");
            }
            return Err(e);
        }

        if self.shared.opts.threads == 0 {
            let mut ds = ds;
            let msg = match self.shared.format_dataset(&mut ds) {
                Ok(msg) => msg,
                Err(e) => {
                    self.shared.count_error();
                    return Err(e);
                }
            };
            self.shared.send_formatted(msg);
            return Ok(());
        }

        let mut route = self.route.lock();
        let tf = ds.timeframe_id();
        let flush_now = ds
            .pages
            .last()
            .is_some_and(|p| p.header().end_of_timeframe());

        if tf != route.current_tf {
            let previous = route.current_tf;
            // the previous timeframe is complete, hand it over
            let _ = self.flush_route(&mut route);
            if previous != UNDEFINED_TIMEFRAME_ID && tf != previous + 1 {
                self.shared
                    .counters
                    .tf_non_contiguous
                    .fetch_add(1, Ordering::Relaxed);
                if let Some(suppressed) = self.shared.drop_throttle.allow() {
                    warn!(
                        dispatcher = %self.shared.opts.name,
                        tf,
                        previous,
                        suppressed,
                        "non-contiguous timeframe ordering"
                    );
                }
            }
            route.current_tf = tf;
        }
        route.buffer.push(ds);
        if flush_now {
            self.flush_route(&mut route)?;
        }
        Ok(())
    }

    /// Push the buffered timeframe to the next worker, round-robin.
    fn flush_route(&self, route: &mut RouteState) -> Result<(), DispatchError> {
        if route.buffer.is_empty() {
            return Ok(());
        }
        let buffer = std::mem::take(&mut route.buffer);
        let worker = &self.shared.workers[route.next_worker];
        match worker.input.push(buffer) {
            Ok(()) => {
                route.next_worker = (route.next_worker + 1) % self.shared.workers.len();
                Ok(())
            }
            Err(_dropped) => {
                self.shared.count_error();
                if let Some(suppressed) = self.shared.drop_throttle.allow() {
                    warn!(
                        dispatcher = %self.shared.opts.name,
                        tf = route.current_tf,
                        suppressed,
                        "dropping timeframe, formatting pipeline full"
                    );
                }
                Err(DispatchError::PipelineFull {
                    timeframe_id: route.current_tf,
                })
            }
        }
    }

    /// Wait until routed work has drained through workers and sender.
    /// Returns false on timeout. Timeframes still buffered in the route
    /// (no end-of-timeframe seen yet) are not flushed.
    pub fn drain_wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let queues_empty = self
                .shared
                .workers
                .iter()
                .all(|w| w.input.is_empty() && w.output.is_empty());
            if queues_empty {
                // let the sender finish the message it may hold
                std::thread::sleep(Duration::from_millis(5));
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Stop the thread pool and log the run summary. Timeframes still
    /// queued are dropped; their pages release through handle drops.
    pub fn stop(&self) {
        {
            let mut route = self.route.lock();
            let _ = self.flush_route(&mut route);
        }
        self.drain_wait(Duration::from_secs(1));
        self.shared.shutdown.store(true, Ordering::SeqCst);
        for handle in self.worker_handles.lock().drain(..) {
            let _ = handle.join();
        }
        if let Some(handle) = self.sender_handle.lock().take() {
            let _ = handle.join();
        }

        let s = self.stats();
        info!(
            dispatcher = %self.shared.opts.name,
            push_success = s.push_success,
            push_error = s.push_error,
            pages_input = s.pages_input,
            pages_repack = s.pages_repack,
            repack_count = s.repack_count,
            repack_avg = s.repack_avg,
            repack_max = s.repack_max,
            "dispatcher stopped"
        );
        info!(dispatcher = %self.shared.opts.name, "{}", self.shared.pool.stats_summary());
    }
}

impl Drop for StfDispatcher {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        for handle in self.worker_handles.get_mut().drain(..) {
            let _ = handle.join();
        }
        if let Some(handle) = self.sender_handle.get_mut().take() {
            let _ = handle.join();
        }
    }
}

// ─── Formatter / sender threads ─────────────────────────────────────

fn worker_loop(shared: Arc<Shared>, ix: usize) {
    let sleep = Duration::from_micros(WORKER_SLEEP_US);
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        // wait for a slot in the outgoing queue first
        if shared.workers[ix].output.is_full() {
            std::thread::sleep(sleep);
            continue;
        }
        let Some(tf) = shared.workers[ix].input.pop() else {
            std::thread::sleep(sleep);
            continue;
        };
        if tf.is_empty() {
            continue;
        }

        let mut batch: MessageBatch = Vec::with_capacity(tf.len());
        let mut failed = false;
        for mut ds in tf {
            match shared.format_dataset(&mut ds) {
                Ok(msg) => batch.push(msg),
                Err(_) => {
                    failed = true;
                    break;
                }
            }
        }
        if !failed && shared.workers[ix].output.push(batch).is_err() {
            failed = true;
        }
        if failed {
            shared.count_error();
        }
    }
}

fn sender_loop(shared: Arc<Shared>) {
    let sleep = Duration::from_micros(WORKER_SLEEP_US);
    let n = shared.workers.len();
    let mut ix = 0usize;
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        let Some(batch) = shared.workers[ix].output.pop() else {
            std::thread::sleep(sleep);
            continue;
        };
        // next timeframe comes from the next worker
        ix = (ix + 1) % n;
        for msg in batch {
            shared.send_formatted(msg);
        }
    }
}

// ─── Formatting ─────────────────────────────────────────────────────

impl Shared {
    fn count_error(&self) {
        self.counters.push_error.fetch_add(1, Ordering::Relaxed);
    }

    /// Build the release hold for a part over `page`.
    fn hold_for(&self, page: &PageRef, payload_bytes: u64) -> PartHold {
        if self.region_backed {
            PartHold::Accounted(TransitGuard::new(page.clone(), payload_bytes))
        } else {
            PartHold::Page(page.clone())
        }
    }

    /// Build one STF message: header part + one part per heartbeat
    /// frame, repacking HBFs that straddle page boundaries.
    fn format_dataset(&self, ds: &mut DataSet) -> Result<FormattedStf, DispatchError> {
        if self.pool.usable_page_size() < STF_HEADER_SIZE {
            return Err(DispatchError::PageTooSmall {
                page_size: self.pool.usable_page_size(),
                required: STF_HEADER_SIZE,
            });
        }
        let mut header_page = self.pool.acquire_block().ok_or(DispatchError::NoPageLeft)?;

        // STF header from the first block; end-of-timeframe from any
        let mut stf = StfHeader::default();
        let mut data_total: u64 = 0;
        for (i, page) in ds.pages.iter().enumerate() {
            let h = page.header();
            data_total += h.data_size as u64;
            if h.end_of_timeframe() {
                stf.last_tf_message = 1;
            }
            if i == 0 {
                stf.timeframe_id = h.timeframe_id;
                stf.run_number = h.run_number;
                stf.system_id = h.system_id;
                stf.link_id = h.link_id;
                stf.fee_id = h.fee_id;
                stf.equipment_id = h.equipment_id;
                stf.tf_orbit_first = h.timeframe_orbit_first;
                stf.tf_orbit_last = h.timeframe_orbit_last;
                stf.is_rdh_format = h.is_rdh_format;
            } else if stf.timeframe_id != h.timeframe_id || stf.link_id != h.link_id {
                if let Some(suppressed) = self.mismatch_throttle.allow() {
                    warn!(
                        dispatcher = %self.opts.name,
                        tf = stf.timeframe_id,
                        link = stf.link_id,
                        page_tf = h.timeframe_id,
                        page_link = h.link_id,
                        suppressed,
                        "dataset page does not match its subtimeframe"
                    );
                }
            }
        }

        header_page.payload_mut()[..STF_HEADER_SIZE].copy_from_slice(stf.as_bytes());
        {
            let h = header_page.header_mut();
            h.data_size = STF_HEADER_SIZE as u32;
            h.timeframe_id = stf.timeframe_id;
        }

        let mut parts: Vec<MessagePart> = Vec::with_capacity(ds.len() + 1);
        if self.region_backed {
            let mem = header_page.memory_size() as u64;
            accounting::init_transit(&mut header_page, mem);
        }
        let hold = self.hold_for(&header_page, STF_HEADER_SIZE as u64);
        parts.push(MessagePart::from_page_range(
            &header_page,
            0,
            STF_HEADER_SIZE,
            hold,
        ));

        // cut into heartbeat frames
        let mut repack = RepackState {
            scratch: None,
            last_hb: None,
            pending: Vec::new(),
        };
        for page in &mut ds.pages {
            if self.region_backed {
                let mem = page.memory_size() as u64;
                accounting::init_transit(page, mem);
            }
            let data_size = (page.header().data_size as usize).min(page.usable_size());
            let mut hb_start = 0usize;
            let mut offset = 0usize;
            while offset + RDH_SIZE <= data_size {
                let Ok(rdh) = RdhView::parse(&page.payload()[offset..data_size]) else {
                    break;
                };
                let hb = rdh.heartbeat_orbit();
                if repack.last_hb != Some(hb) {
                    let hb_len = offset - hb_start;
                    if hb_len > 0 {
                        repack.pending.push(PendingFrame {
                            page: page.clone(),
                            start: hb_start,
                            len: hb_len,
                        });
                    }
                    self.collect_pending(&mut repack, &mut parts)?;
                    hb_start = offset;
                    repack.last_hb = Some(hb);
                }
                let next = rdh.offset_next_packet();
                if next == 0 {
                    break;
                }
                offset += next as usize;
            }
            // the tail may continue in the next page of the dataset
            if hb_start < data_size {
                repack.pending.push(PendingFrame {
                    page: page.clone(),
                    start: hb_start,
                    len: data_size - hb_start,
                });
            }
        }
        self.collect_pending(&mut repack, &mut parts)?;

        Ok(FormattedStf {
            tf_id: stf.timeframe_id,
            parts,
            total_size: STF_HEADER_SIZE as u64 + data_total,
        })
    }

    /// Collapse the accumulated HBF fragments into one message part:
    /// a single fragment is referenced in place, several are repacked
    /// into a contiguous copy.
    fn collect_pending(
        &self,
        repack: &mut RepackState,
        parts: &mut Vec<MessagePart>,
    ) -> Result<(), DispatchError> {
        match repack.pending.len() {
            0 => return Ok(()),
            1 => {
                let f = repack.pending.pop().expect("one pending frame");
                let hold = self.hold_for(&f.page, f.len as u64);
                parts.push(MessagePart::from_page_range(&f.page, f.start, f.len, hold));
                return Ok(());
            }
            _ => {}
        }

        GLOBAL_STATS.hbf_repacked.fetch_add(1, Ordering::Relaxed);
        let total: usize = repack.pending.iter().map(|f| f.len).sum();
        self.counters.repack_sizes.lock().set(total as u64);

        if self.pool.usable_page_size() < total {
            if let Some(suppressed) = self.page_throttle.allow() {
                warn!(
                    dispatcher = %self.opts.name,
                    page_size = self.pool.usable_page_size(),
                    required = total,
                    suppressed,
                    "page too small to repack heartbeat frame"
                );
            }
            repack.pending.clear();
            return Err(DispatchError::PageTooSmall {
                page_size: self.pool.usable_page_size(),
                required: total,
            });
        }

        // allocate the copy target: child of the current scratch page
        // when packed copy is on, a fresh page otherwise
        let mut copy_block: Option<PageRef> = None;
        let mut new_scratch = false;
        if self.opts.packed_copy {
            for _ in 0..=2 {
                let Some(scratch) = repack.scratch.as_ref() else {
                    repack.scratch = self.pool.acquire_block();
                    if repack.scratch.is_none() {
                        break;
                    }
                    new_scratch = true;
                    self.counters.pages_repack.fetch_add(1, Ordering::Relaxed);
                    continue;
                };
                if let Some(child) = scratch.child_block(total) {
                    copy_block = Some(child);
                    break;
                }
                // scratch tail exhausted, start a fresh one
                repack.scratch = None;
                new_scratch = false;
            }
        } else {
            copy_block = self.pool.acquire_block();
            if copy_block.is_some() {
                new_scratch = true;
                self.counters.pages_repack.fetch_add(1, Ordering::Relaxed);
            }
        }
        let Some(mut copy_block) = copy_block else {
            if let Some(suppressed) = self.page_throttle.allow() {
                warn!(dispatcher = %self.opts.name, suppressed, "no page left for repack");
            }
            repack.pending.clear();
            return Err(DispatchError::NoPageLeft);
        };

        if self.region_backed && new_scratch {
            let mem = copy_block.memory_size() as u64;
            accounting::init_transit(&mut copy_block, mem);
        }

        {
            let dst = copy_block.payload_mut();
            let mut ix = 0usize;
            for f in &repack.pending {
                dst[ix..ix + f.len].copy_from_slice(&f.page.payload()[f.start..f.start + f.len]);
                ix += f.len;
            }
        }
        GLOBAL_STATS.bytes_copied.fetch_add(total as u64, Ordering::Relaxed);
        repack.pending.clear();

        let hold = self.hold_for(&copy_block, total as u64);
        parts.push(MessagePart::from_page_range(&copy_block, 0, total, hold));
        Ok(())
    }

    // ─── Send paths ─────────────────────────────────────────────────

    fn send_formatted(&self, msg: FormattedStf) {
        match self.transport.send(msg.parts) {
            Ok(_) => {
                GLOBAL_STATS
                    .bytes_sent
                    .fetch_add(msg.total_size, Ordering::Relaxed);
                GLOBAL_STATS
                    .timeframe_id_sent
                    .store(msg.tf_id, Ordering::Relaxed);
                GLOBAL_STATS.notify.fetch_add(1, Ordering::Relaxed);
                self.counters.push_success.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                if let Some(suppressed) = self.send_throttle.allow() {
                    warn!(dispatcher = %self.opts.name, suppressed, "sending failed: {e}");
                }
                self.count_error();
            }
        }
    }

    /// Raw mode: one single-part message per source page, no header.
    fn send_raw(&self, ds: DataSet) -> Result<(), DispatchError> {
        let mut first_err = None;
        for page in &ds.pages {
            let len = page.header().data_size as usize;
            let part =
                MessagePart::from_page_range(page, 0, len, PartHold::Page(page.clone()));
            match self.transport.send(vec![part]) {
                Ok(sent) => {
                    GLOBAL_STATS.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
                    GLOBAL_STATS.notify.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => first_err = first_err.or(Some(e)),
            }
        }
        match first_err {
            None => {
                self.counters.push_success.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Some(e) => {
                self.count_error();
                Err(e)
            }
        }
    }

    /// DataBlock raw mode: per page one message of header part +
    /// payload part.
    fn send_raw_datablock(&self, ds: DataSet) -> Result<(), DispatchError> {
        let mut first_err = None;
        for page in &ds.pages {
            let header_ptr = page.header() as *const _ as *const u8;
            let header_part = MessagePart::new(
                header_ptr,
                DATA_BLOCK_HEADER_SIZE,
                PartHold::Page(page.clone()),
            );
            let len = page.header().data_size as usize;
            let body_part =
                MessagePart::from_page_range(page, 0, len, PartHold::Page(page.clone()));
            match self.transport.send(vec![header_part, body_part]) {
                Ok(sent) => {
                    GLOBAL_STATS.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
                    GLOBAL_STATS.notify.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => first_err = first_err.or(Some(e)),
            }
        }
        match first_err {
            None => {
                self.counters.push_success.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Some(e) => {
                self.count_error();
                Err(e)
            }
        }
    }

    /// Superpage mode: one STF header + one part per source page, no
    /// HBF splitting. Also the fallback for non-RDH payloads.
    fn send_stf_superpage(&self, ds: DataSet) -> Result<(), DispatchError> {
        let Some(mut header_page) = self.pool.acquire_block() else {
            self.count_error();
            return Err(DispatchError::NoPageLeft);
        };

        let mut stf = StfHeader::default();
        if let Some(first) = ds.pages.first() {
            let h = first.header();
            stf.timeframe_id = h.timeframe_id;
            stf.run_number = h.run_number;
            stf.system_id = h.system_id;
            stf.link_id = h.link_id;
            stf.fee_id = h.fee_id;
            stf.equipment_id = h.equipment_id;
            stf.tf_orbit_first = h.timeframe_orbit_first;
            stf.tf_orbit_last = h.timeframe_orbit_last;
            stf.is_rdh_format = h.is_rdh_format;
        }
        if ds
            .pages
            .last()
            .is_some_and(|p| p.header().end_of_timeframe())
        {
            stf.last_tf_message = 1;
        }

        header_page.payload_mut()[..STF_HEADER_SIZE].copy_from_slice(stf.as_bytes());
        header_page.header_mut().data_size = STF_HEADER_SIZE as u32;

        let mut parts = Vec::with_capacity(ds.len() + 1);
        let hold = PartHold::Page(header_page.clone());
        parts.push(MessagePart::from_page_range(
            &header_page,
            0,
            STF_HEADER_SIZE,
            hold,
        ));
        let mut total = STF_HEADER_SIZE as u64;
        for page in &ds.pages {
            let len = page.header().data_size as usize;
            total += len as u64;
            parts.push(MessagePart::from_page_range(
                page,
                0,
                len,
                PartHold::Page(page.clone()),
            ));
        }

        match self.transport.send(parts) {
            Ok(_) => {
                GLOBAL_STATS.bytes_sent.fetch_add(total, Ordering::Relaxed);
                GLOBAL_STATS
                    .timeframe_id_sent
                    .store(stf.timeframe_id, Ordering::Relaxed);
                GLOBAL_STATS.notify.fetch_add(1, Ordering::Relaxed);
                self.counters.push_success.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                if let Some(suppressed) = self.send_throttle.allow() {
                    warn!(dispatcher = %self.opts.name, suppressed, "sending failed: {e}");
                }
                self.count_error();
                Err(e)
            }
        }
    }
}
