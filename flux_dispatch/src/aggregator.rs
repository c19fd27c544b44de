//! Data aggregation.
//!
//! Bridges the equipment FIFOs and the dispatcher: pages are bucketed
//! per (equipment, link) into the current timeframe's dataset; a bucket
//! is flushed when its timeframe changes (the outgoing dataset's last
//! page gets the end-of-timeframe flag) and at shutdown, when the run
//! itself ends every open bucket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use flux_common::throttle::LogThrottle;
use flux_memory::PageRef;
use flux_readout::PageFifo;
use tracing::{info, warn};

use crate::dataset::DataSet;
use crate::dispatcher::StfDispatcher;

/// Pages drained from one FIFO per sweep, so one busy equipment cannot
/// starve the others.
const DRAIN_BURST: usize = 32;

struct Bucket {
    timeframe_id: u64,
    pages: Vec<PageRef>,
}

/// Groups equipment output into per-(timeframe, link) datasets.
pub struct DataAggregator {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

struct AggregatorLoop {
    inputs: Vec<Arc<PageFifo>>,
    dispatcher: Arc<StfDispatcher>,
    shutdown: Arc<AtomicBool>,
    idle_sleep: Duration,
    buckets: HashMap<(usize, u8), Bucket>,
    push_throttle: LogThrottle,
}

impl DataAggregator {
    /// Start the aggregation thread over `inputs`.
    pub fn start(
        inputs: Vec<Arc<PageFifo>>,
        dispatcher: Arc<StfDispatcher>,
    ) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut al = AggregatorLoop {
            inputs,
            dispatcher,
            shutdown: Arc::clone(&shutdown),
            idle_sleep: Duration::from_micros(200),
            buckets: HashMap::new(),
            push_throttle: LogThrottle::new(Duration::from_secs(10)),
        };
        let thread = std::thread::Builder::new()
            .name("aggregator".to_string())
            .spawn(move || al.run())?;
        info!("aggregator started");
        Ok(Self {
            shutdown,
            thread: Some(thread),
        })
    }

    /// Stop the thread; remaining FIFO pages are drained and every open
    /// bucket is flushed as the end of its timeframe.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        info!("aggregator stopped");
    }
}

impl Drop for DataAggregator {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl AggregatorLoop {
    fn run(&mut self) {
        loop {
            let active = self.sweep();
            if self.shutdown.load(Ordering::Acquire) {
                // final drain: FIFOs first, then open buckets
                while self.sweep() {}
                self.flush_all();
                break;
            }
            if !active {
                std::thread::sleep(self.idle_sleep);
            }
        }
    }

    /// One pass over all input FIFOs. Returns whether any page moved.
    fn sweep(&mut self) -> bool {
        let mut active = false;
        for input_ix in 0..self.inputs.len() {
            for _ in 0..DRAIN_BURST {
                let Some(page) = self.inputs[input_ix].pop() else {
                    break;
                };
                active = true;
                self.route(input_ix, page);
            }
        }
        active
    }

    /// Put one page into its (equipment, link) bucket, flushing the
    /// bucket first when the timeframe changed.
    fn route(&mut self, input_ix: usize, page: PageRef) {
        let h = page.header();
        let key = (input_ix, h.link_id);
        let tf = h.timeframe_id;
        let flagged_eotf = h.end_of_timeframe();

        let bucket = self.buckets.entry(key).or_insert_with(|| Bucket {
            timeframe_id: tf,
            pages: Vec::new(),
        });
        if bucket.timeframe_id != tf && !bucket.pages.is_empty() {
            let pages = std::mem::take(&mut bucket.pages);
            Self::dispatch(
                &self.dispatcher,
                &self.push_throttle,
                pages,
                true,
            );
        }
        bucket.timeframe_id = tf;
        bucket.pages.push(page);

        // an upstream end-of-timeframe flag closes the dataset at once
        if flagged_eotf {
            let pages = std::mem::take(&mut bucket.pages);
            Self::dispatch(&self.dispatcher, &self.push_throttle, pages, false);
        }
    }

    /// End of run: every open bucket closes its timeframe.
    fn flush_all(&mut self) {
        let mut keys: Vec<_> = self.buckets.keys().copied().collect();
        keys.sort_unstable();
        for key in keys {
            if let Some(bucket) = self.buckets.get_mut(&key) {
                if bucket.pages.is_empty() {
                    continue;
                }
                let pages = std::mem::take(&mut bucket.pages);
                Self::dispatch(&self.dispatcher, &self.push_throttle, pages, true);
            }
        }
    }

    fn dispatch(
        dispatcher: &StfDispatcher,
        throttle: &LogThrottle,
        mut pages: Vec<PageRef>,
        mark_eotf: bool,
    ) {
        if mark_eotf {
            if let Some(last) = pages.last_mut() {
                last.header_mut().flag_end_of_timeframe = 1;
            }
        }
        if let Err(e) = dispatcher.push_dataset(DataSet::new(pages)) {
            if let Some(suppressed) = throttle.allow() {
                warn!(suppressed, "dataset dispatch failed: {e}");
            }
        }
    }
}
