//! In-flight page accounting.
//!
//! A small POD struct embedded in each page's `user_space` tracks how
//! many transport messages still reference the page. The first reference
//! bumps the process-wide pending counters and records the start time;
//! the last release reverses them and records the in-flight lifetime.
//! The magic byte guards against double-init and post-release updates.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use flux_common::datablock::USER_SPACE_SIZE;
use flux_common::stats::GLOBAL_STATS;
use flux_memory::PageRef;
use static_assertions::const_assert;

const MAGIC_ACTIVE: u8 = 0xAA;

// TransitStats layout inside DataBlockHeader.user_space (repr(C), 32 B):
//   [0]      magic:         u8
//   [1..4]   (padding)
//   [4..8]   ref_count:     i32  (atomic at runtime)
//   [8..16]  t0_us:         u64
//   [16..24] payload_bytes: u64
//   [24..32] memory_bytes:  u64
#[repr(C)]
struct TransitStats {
    magic: u8,
    _pad: [u8; 3],
    ref_count: i32,
    t0_us: u64,
    payload_bytes: u64,
    memory_bytes: u64,
}

const_assert!(core::mem::size_of::<TransitStats>() <= USER_SPACE_SIZE);

fn now_us() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_micros() as u64
}

/// Raw pointer to the transit stats of the page owning `page`'s bytes.
///
/// All writers of one page's stats run on the thread formatting that
/// page's dataset; only `ref_count` is touched concurrently (release
/// callbacks) and goes through an atomic view.
fn stats_ptr(page: &PageRef) -> *mut TransitStats {
    // user_space is 8-aligned inside the header, TransitStats needs 8.
    page.header().user_space.as_ptr() as *mut TransitStats
}

fn ref_count(stats: *mut TransitStats) -> &'static AtomicI32 {
    // SAFETY: field is 4-aligned inside user_space and the page outlives
    // every guard that can reach it (guard holds a PageRef).
    unsafe { AtomicI32::from_ptr(core::ptr::addr_of_mut!((*stats).ref_count)) }
}

/// Arm accounting on a page entering the in-flight path. Overwrites any
/// previous state; call once per page per message.
pub fn init_transit(page: &mut PageRef, memory_bytes: u64) {
    let s = stats_ptr(page);
    // SAFETY: exclusive access during formatting (see stats_ptr).
    unsafe {
        (*s).magic = MAGIC_ACTIVE;
        (*s).ref_count = 0;
        (*s).t0_us = 0;
        (*s).payload_bytes = 0;
        (*s).memory_bytes = memory_bytes;
    }
}

/// Add one in-flight reference accounting `payload_bytes`.
pub fn inc_transit(page: &PageRef, payload_bytes: u64) {
    let s = stats_ptr(page);
    // SAFETY: magic/memory/payload written only by the formatting thread.
    unsafe {
        if (*s).magic != MAGIC_ACTIVE {
            return;
        }
        if ref_count(s).fetch_add(1, Ordering::AcqRel) == 0 {
            (*s).t0_us = now_us();
            GLOBAL_STATS.pages_pending.fetch_add(1, Ordering::Relaxed);
            GLOBAL_STATS
                .memory_pending_bytes
                .fetch_add((*s).memory_bytes as i64, Ordering::Relaxed);
            GLOBAL_STATS.notify.fetch_add(1, Ordering::Relaxed);
        }
        (*s).payload_bytes += payload_bytes;
        GLOBAL_STATS
            .payload_pending_bytes
            .fetch_add(payload_bytes as i64, Ordering::Relaxed);
    }
}

/// Drop one in-flight reference; the last one releases the page from
/// the pending counters.
pub fn dec_transit(page: &PageRef) {
    let s = stats_ptr(page);
    // SAFETY: see inc_transit; the last decrement is the only writer left.
    unsafe {
        if (*s).magic != MAGIC_ACTIVE {
            return;
        }
        if ref_count(s).fetch_sub(1, Ordering::AcqRel) == 1 {
            GLOBAL_STATS.pages_pending.fetch_sub(1, Ordering::Relaxed);
            GLOBAL_STATS.pages_released.fetch_add(1, Ordering::Relaxed);
            GLOBAL_STATS
                .pages_pending_time_us
                .fetch_add(now_us().saturating_sub((*s).t0_us), Ordering::Relaxed);
            GLOBAL_STATS
                .payload_pending_bytes
                .fetch_sub((*s).payload_bytes as i64, Ordering::Relaxed);
            GLOBAL_STATS
                .memory_pending_bytes
                .fetch_sub((*s).memory_bytes as i64, Ordering::Relaxed);
            GLOBAL_STATS.notify.fetch_add(1, Ordering::Relaxed);
            (*s).magic = 0;
        }
    }
}

/// RAII in-flight reference: increments on creation, decrements when the
/// transport releases the message part.
pub struct TransitGuard {
    page: PageRef,
}

impl TransitGuard {
    pub fn new(page: PageRef, payload_bytes: u64) -> Self {
        inc_transit(&page, payload_bytes);
        Self { page }
    }

    pub fn page(&self) -> &PageRef {
        &self.page
    }
}

impl Drop for TransitGuard {
    fn drop(&mut self) {
        dec_transit(&self.page);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use flux_memory::{MemoryBank, MemoryBankManager};
    use parking_lot::Mutex;

    // The tests below assert exact values of process-wide counters;
    // serialize them.
    static STATS_LOCK: Mutex<()> = Mutex::new(());

    fn page() -> PageRef {
        let manager = MemoryBankManager::new();
        manager
            .add_bank(Arc::new(MemoryBank::new_owned("a", 64 * 1024).unwrap()))
            .unwrap();
        let pool = manager.get_paged_pool(4096, 4, "a", 0, 0).unwrap();
        pool.acquire_block().unwrap()
    }

    #[test]
    fn guard_balances_pending_counters() {
        let _lock = STATS_LOCK.lock();
        let mut p = page();
        let before = GLOBAL_STATS.pages_pending.load(Ordering::Relaxed);

        init_transit(&mut p, 4096);
        let g1 = TransitGuard::new(p.clone(), 100);
        let g2 = TransitGuard::new(p.clone(), 50);
        assert_eq!(GLOBAL_STATS.pages_pending.load(Ordering::Relaxed), before + 1);

        drop(g1);
        assert_eq!(
            GLOBAL_STATS.pages_pending.load(Ordering::Relaxed),
            before + 1,
            "page stays pending until the last reference"
        );
        drop(g2);
        assert_eq!(GLOBAL_STATS.pages_pending.load(Ordering::Relaxed), before);
    }

    #[test]
    fn unarmed_page_is_ignored() {
        let _lock = STATS_LOCK.lock();
        let p = page();
        let before = GLOBAL_STATS.pages_pending.load(Ordering::Relaxed);
        inc_transit(&p, 10);
        dec_transit(&p);
        assert_eq!(GLOBAL_STATS.pages_pending.load(Ordering::Relaxed), before);
    }

    #[test]
    fn released_page_rejects_late_references() {
        let _lock = STATS_LOCK.lock();
        let mut p = page();
        init_transit(&mut p, 4096);
        let g = TransitGuard::new(p.clone(), 10);
        drop(g);

        let before = GLOBAL_STATS.pages_pending.load(Ordering::Relaxed);
        inc_transit(&p, 10);
        assert_eq!(
            GLOBAL_STATS.pages_pending.load(Ordering::Relaxed),
            before,
            "magic cleared on release blocks reuse"
        );
    }
}
