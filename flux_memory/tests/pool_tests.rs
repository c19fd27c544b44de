//! Pool and page-handle behavior: state accounting, release on drop,
//! child allocations, carving alignment and exhaustion handling.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use flux_common::consts::UNDEFINED_TIMEFRAME_ID;
use flux_common::datablock::DATA_BLOCK_HEADER_SIZE;
use flux_memory::{MemoryBank, MemoryBankManager, MemoryError, PagedPool};

const PAGE: usize = 4096;

fn pool_of(pages: usize) -> Arc<PagedPool> {
    let manager = MemoryBankManager::new();
    manager
        .add_bank(Arc::new(
            MemoryBank::new_owned("t", PAGE * (pages + 2)).unwrap(),
        ))
        .unwrap();
    manager.get_paged_pool(PAGE, pages, "t", 0, 0).unwrap()
}

#[test]
fn free_plus_outstanding_equals_total() {
    let pool = pool_of(4);
    assert_eq!(pool.stats().free_pages, 4);

    let a = pool.acquire().unwrap();
    let b = pool.acquire().unwrap();
    let s = pool.stats();
    assert_eq!(s.free_pages, 2);
    assert_eq!(s.total_pages, 4);
    assert_ne!(a.page_index(), b.page_index());

    drop(a);
    assert_eq!(pool.stats().free_pages, 3);
    drop(b);
    assert_eq!(pool.stats().free_pages, 4);
    assert_eq!(pool.stats().high_water_mark, 2);
}

#[test]
fn clone_shares_ownership() {
    let pool = pool_of(2);
    let page = pool.acquire().unwrap();
    let clone = page.clone();
    drop(page);
    assert_eq!(pool.stats().free_pages, 1, "clone keeps the page out");
    drop(clone);
    assert_eq!(pool.stats().free_pages, 2);
}

#[test]
fn lifo_reuse() {
    let pool = pool_of(4);
    let a = pool.acquire().unwrap();
    let ix = a.page_index();
    drop(a);
    let b = pool.acquire().unwrap();
    assert_eq!(b.page_index(), ix, "free stack is LIFO");
}

#[test]
fn exhaustion_counts_and_warns() {
    let pool = pool_of(2);
    let warnings = Arc::new(AtomicUsize::new(0));
    let w = Arc::clone(&warnings);
    pool.set_warning_callback(Box::new(move |_msg| {
        w.fetch_add(1, Ordering::Relaxed);
    }));

    let _a = pool.acquire().unwrap();
    let _b = pool.acquire().unwrap();
    assert!(pool.acquire().is_none());
    assert!(pool.acquire().is_none());

    let s = pool.stats();
    assert_eq!(s.acquire_failures, 2);
    assert_eq!(warnings.load(Ordering::Relaxed), 2);

    drop(_a);
    assert!(pool.acquire().is_some(), "release makes a page available again");
}

#[test]
fn acquire_block_initializes_header() {
    let pool = pool_of(2);
    let page = pool.acquire_block().unwrap();
    let h = page.header();
    assert_eq!(h.block_id, 0);
    assert_eq!(h.timeframe_id, UNDEFINED_TIMEFRAME_ID);
    assert_eq!(h.memory_size as usize, PAGE);
    assert_eq!(h.header_size as usize, DATA_BLOCK_HEADER_SIZE);
    assert_eq!(page.usable_size(), PAGE - DATA_BLOCK_HEADER_SIZE);
}

#[test]
fn payload_roundtrip() {
    let pool = pool_of(2);
    let mut page = pool.acquire_block().unwrap();
    page.payload_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
    assert_eq!(&page.payload()[..4], &[1, 2, 3, 4]);
}

#[test]
fn child_blocks_partition_the_tail() {
    let pool = pool_of(2);
    let mut parent = pool.acquire_block().unwrap();
    parent.payload_mut().fill(0);

    let mut c1 = parent.child_block(1000).unwrap();
    let mut c2 = parent.child_block(500).unwrap();
    assert!(c1.is_child() && c2.is_child());
    assert_eq!(c1.usable_size(), 1000);
    assert_eq!(c2.usable_size(), 500);

    c1.payload_mut().fill(0xAA);
    c2.payload_mut().fill(0xBB);
    // disjoint ranges: c1 untouched by c2's fill
    assert!(c1.payload().iter().all(|&b| b == 0xAA));

    // children live inside the parent payload, in carving order
    assert_eq!(&parent.payload()[..1000], c1.payload());
    assert_eq!(&parent.payload()[1000..1500], c2.payload());
}

#[test]
fn child_keeps_page_alive() {
    let pool = pool_of(2);
    let parent = pool.acquire_block().unwrap();
    let child = parent.child_block(64).unwrap();

    drop(parent);
    assert_eq!(pool.stats().free_pages, 1, "child still holds the page");
    drop(child);
    assert_eq!(pool.stats().free_pages, 2);
}

#[test]
fn child_carving_exhausts() {
    let pool = pool_of(2);
    let parent = pool.acquire_block().unwrap();
    let available = parent.tail_available();
    assert_eq!(available, PAGE - DATA_BLOCK_HEADER_SIZE);

    let _c = parent.child_block(available).unwrap();
    assert!(parent.child_block(1).is_none());
    assert_eq!(parent.tail_available(), 0);
}

#[test]
fn duplicate_bank_name_is_rejected() {
    let manager = MemoryBankManager::new();
    manager
        .add_bank(Arc::new(MemoryBank::new_owned("dup", PAGE * 4).unwrap()))
        .unwrap();
    let err = manager
        .add_bank(Arc::new(MemoryBank::new_owned("dup", PAGE * 4).unwrap()))
        .unwrap_err();
    assert!(matches!(err, MemoryError::BankAlreadyExists { .. }));
}

#[test]
fn unknown_bank_is_rejected() {
    let manager = MemoryBankManager::new();
    let err = manager
        .get_paged_pool(PAGE, 2, "missing", 0, 0)
        .unwrap_err();
    assert!(matches!(err, MemoryError::BankNotFound { .. }));
}

#[test]
fn carves_do_not_overlap() {
    let manager = MemoryBankManager::new();
    manager
        .add_bank(Arc::new(MemoryBank::new_owned("b", PAGE * 10).unwrap()))
        .unwrap();

    let p1 = manager.get_paged_pool(PAGE, 3, "b", 0, 0).unwrap();
    let p2 = manager.get_paged_pool(PAGE, 3, "b", 0, 0).unwrap();

    let mut a = p1.acquire_block().unwrap();
    let mut b = p2.acquire_block().unwrap();
    a.payload_mut().fill(0x11);
    b.payload_mut().fill(0x22);
    assert!(a.payload().iter().all(|&x| x == 0x11));
    assert!(b.payload().iter().all(|&x| x == 0x22));
}

#[test]
fn empty_bank_name_picks_first_with_room() {
    let manager = MemoryBankManager::new();
    manager
        .add_bank(Arc::new(MemoryBank::new_owned("small", PAGE).unwrap()))
        .unwrap();
    manager
        .add_bank(Arc::new(MemoryBank::new_owned("big", PAGE * 8).unwrap()))
        .unwrap();

    // 4 pages cannot fit in "small"; the manager falls through to "big".
    let pool = manager.get_paged_pool(PAGE, 4, "", 0, 0).unwrap();
    assert_eq!(pool.bank().name(), "big");
}

#[test]
fn no_space_is_reported() {
    let manager = MemoryBankManager::new();
    manager
        .add_bank(Arc::new(MemoryBank::new_owned("b", PAGE * 2).unwrap()))
        .unwrap();
    let err = manager.get_paged_pool(PAGE, 8, "b", 0, 0).unwrap_err();
    assert!(matches!(err, MemoryError::NoSpace { .. }));
}

#[test]
fn misaligned_geometry_is_rejected() {
    let manager = MemoryBankManager::new();
    manager
        .add_bank(Arc::new(MemoryBank::new_owned("b", PAGE * 8).unwrap()))
        .unwrap();
    assert!(matches!(
        manager.get_paged_pool(PAGE + 1, 2, "b", 0, 0),
        Err(MemoryError::Misaligned { .. })
    ));
    assert!(matches!(
        manager.get_paged_pool(PAGE, 2, "b", 100, 0),
        Err(MemoryError::Misaligned { .. })
    ));
    assert!(matches!(
        manager.get_paged_pool(64, 2, "b", 0, 0),
        Err(MemoryError::PageTooSmall { .. })
    ));
}

#[test]
fn first_page_offset_shifts_pages() {
    let manager = MemoryBankManager::new();
    let bank = Arc::new(MemoryBank::new_owned("b", PAGE * 8).unwrap());
    let base = bank.base_ptr().as_ptr() as usize;
    manager.add_bank(bank).unwrap();

    let offset = PAGE - DATA_BLOCK_HEADER_SIZE;
    let pool = manager.get_paged_pool(PAGE, 2, "b", offset, 0).unwrap();
    let page = pool.acquire().unwrap();
    // page 1 (LIFO pops page 0 first)... page 0: starts at carve + offset
    let payload_addr = page.payload_ptr() as usize;
    assert_eq!(
        (payload_addr - base) % PAGE,
        0,
        "payload of the first page lands on a page-size boundary"
    );
}

#[test]
fn pool_keeps_bank_alive() {
    let manager = MemoryBankManager::new();
    manager
        .add_bank(Arc::new(MemoryBank::new_owned("b", PAGE * 4).unwrap()))
        .unwrap();
    let pool = manager.get_paged_pool(PAGE, 2, "b", 0, 0).unwrap();
    drop(manager);

    // bank is still reachable through the pool; pages stay usable
    let mut page = pool.acquire_block().unwrap();
    page.payload_mut().fill(0x5A);
    assert!(page.payload().iter().all(|&b| b == 0x5A));
}
