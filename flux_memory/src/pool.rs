//! Fixed-size paged pool.
//!
//! A pool owns a slice of a bank divided into `page_count` pages of
//! `page_size` bytes. Free pages sit on a LIFO stack (index-only, for
//! cache friendliness and so the pool never holds page handles).
//! Acquisition is non-blocking; release happens exclusively through
//! [`PageRef`](crate::page::PageRef) drops.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use flux_common::datablock::DATA_BLOCK_HEADER_SIZE;
use parking_lot::Mutex;

use crate::bank::MemoryBank;
use crate::page::PageRef;

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(0);

/// Callback fired (unthrottled) on acquisition failure. Callers are
/// expected to rate-limit what they log.
pub type WarningCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total_pages: usize,
    pub free_pages: usize,
    /// Most pages ever simultaneously outstanding.
    pub high_water_mark: usize,
    /// Failed acquisitions (pool empty).
    pub acquire_failures: u64,
}

/// Fixed pool of equally sized pages carved from one bank slice.
pub struct PagedPool {
    id: usize,
    page_size: usize,
    page_count: usize,
    /// Address of page 0.
    base: NonNull<u8>,
    /// LIFO stack of free page indices.
    free: Mutex<Vec<u32>>,
    used: AtomicUsize,
    high_water: AtomicUsize,
    acquire_failures: AtomicU64,
    warning: Mutex<Option<WarningCallback>>,
    /// Keeps the backing bank alive for the pool's lifetime.
    bank: Arc<MemoryBank>,
}

// SAFETY: the raw base pointer is only dereferenced through PageRef,
// which enforces the page ownership protocol; all pool bookkeeping is
// behind the mutex or atomic.
unsafe impl Send for PagedPool {}
unsafe impl Sync for PagedPool {}

impl PagedPool {
    /// Build a pool over `page_count * page_size` bytes starting at
    /// `base` (already offset inside the bank by the manager).
    pub(crate) fn new(
        bank: Arc<MemoryBank>,
        base: NonNull<u8>,
        page_size: usize,
        page_count: usize,
    ) -> Arc<Self> {
        // LIFO: page 0 is popped first.
        let free: Vec<u32> = (0..page_count as u32).rev().collect();
        Arc::new(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            page_size,
            page_count,
            base,
            free: Mutex::new(free),
            used: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            acquire_failures: AtomicU64::new(0),
            warning: Mutex::new(None),
            bank,
        })
    }

    /// Pool id, unique within the process.
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Payload capacity of each page.
    #[inline]
    pub fn usable_page_size(&self) -> usize {
        self.page_size - DATA_BLOCK_HEADER_SIZE
    }

    /// Bank backing this pool.
    pub fn bank(&self) -> &Arc<MemoryBank> {
        &self.bank
    }

    /// Non-blocking page acquisition. Returns `None` when the pool is
    /// empty (counted, warning callback fired).
    pub fn acquire(self: &Arc<Self>) -> Option<PageRef> {
        let index = self.free.lock().pop();
        match index {
            Some(index) => {
                let used = self.used.fetch_add(1, Ordering::Relaxed) + 1;
                self.high_water.fetch_max(used, Ordering::Relaxed);
                Some(PageRef::new_full(Arc::clone(self), index))
            }
            None => {
                self.acquire_failures.fetch_add(1, Ordering::Relaxed);
                if let Some(cb) = self.warning.lock().as_ref() {
                    cb(&format!(
                        "pool [{}] empty: {} pages of {} bytes all in use",
                        self.id, self.page_count, self.page_size
                    ));
                }
                None
            }
        }
    }

    /// Acquire a page and initialize its in-band DataBlock header.
    pub fn acquire_block(self: &Arc<Self>) -> Option<PageRef> {
        let mut page = self.acquire()?;
        page.init_header();
        Some(page)
    }

    /// Return a page to the free stack. Called only from the page core
    /// drop; a page index can therefore never be pushed twice.
    pub(crate) fn release(&self, index: u32) {
        debug_assert!((index as usize) < self.page_count);
        self.free.lock().push(index);
        self.used.fetch_sub(1, Ordering::Relaxed);
    }

    /// Address of page `index`.
    #[inline]
    pub(crate) fn page_ptr(&self, index: u32) -> NonNull<u8> {
        debug_assert!((index as usize) < self.page_count);
        // SAFETY: index is within the pool slice carved by the manager.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(index as usize * self.page_size)) }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total_pages: self.page_count,
            free_pages: self.free.lock().len(),
            high_water_mark: self.high_water.load(Ordering::Relaxed),
            acquire_failures: self.acquire_failures.load(Ordering::Relaxed),
        }
    }

    /// Install the acquisition-failure callback.
    pub fn set_warning_callback(&self, cb: WarningCallback) {
        *self.warning.lock() = Some(cb);
    }

    /// One-line stats summary for shutdown logs.
    pub fn stats_summary(&self) -> String {
        let s = self.stats();
        format!(
            "pool [{}]: {} pages x {} bytes, free={} highWater={} acquireFailures={}",
            self.id, s.total_pages, self.page_size, s.free_pages, s.high_water_mark, s.acquire_failures
        )
    }
}

impl std::fmt::Debug for PagedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagedPool")
            .field("id", &self.id)
            .field("page_size", &self.page_size)
            .field("page_count", &self.page_count)
            .finish()
    }
}
