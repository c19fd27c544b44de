//! End-to-end equipment behavior: tagging, ordering, rate limiting,
//! back-pressure and RDH-derived timeframe identification.

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use flux_common::config::ReadoutConfig;
use flux_common::consts::UNDEFINED_TIMEFRAME_ID;
use flux_common::datablock::DataBlockHeader;
use flux_memory::{MemoryBank, MemoryBankManager, PageRef};
use flux_readout::equipment::EquipmentState;
use flux_readout::sources::equipment_from_config;
use flux_readout::{PageFifo, ReadoutEquipment};

fn manager_with_bank(size: usize) -> MemoryBankManager {
    let manager = MemoryBankManager::new();
    manager
        .add_bank(Arc::new(MemoryBank::new_owned("test-bank", size).unwrap()))
        .unwrap();
    manager
}

fn build_equipment(toml: &str, manager: &MemoryBankManager) -> ReadoutEquipment {
    let cfg = ReadoutConfig::from_toml(toml).unwrap();
    equipment_from_config(&cfg.equipment[0], &cfg.readout, manager, 0).unwrap()
}

/// Pop pages until `n` collected or `timeout` expires.
fn drain(fifo: &PageFifo, n: usize, timeout: Duration) -> Vec<PageRef> {
    let deadline = Instant::now() + timeout;
    let mut out = Vec::with_capacity(n);
    while out.len() < n && Instant::now() < deadline {
        match fifo.pop() {
            Some(p) => out.push(p),
            None => std::thread::sleep(Duration::from_micros(200)),
        }
    }
    out
}

/// Pop pages, keep only their headers and release them immediately so
/// the pool never starves while collecting.
fn drain_headers(fifo: &PageFifo, n: usize, timeout: Duration) -> Vec<DataBlockHeader> {
    let deadline = Instant::now() + timeout;
    let mut out = Vec::with_capacity(n);
    while out.len() < n && Instant::now() < deadline {
        match fifo.pop() {
            Some(p) => out.push(*p.header()),
            None => std::thread::sleep(Duration::from_micros(200)),
        }
    }
    out
}

#[test]
fn dummy_pages_are_tagged_in_order() {
    let manager = manager_with_bank(1 << 20);
    let mut eq = build_equipment(
        r#"
        [readout]
        run_number = 777

        [[equipment]]
        equipment_type = "dummy"
        id = 42
        memory_pool_page_size = "4k"
        memory_pool_number_of_pages = 8
        dummy_payload_size = "1k"
        "#,
        &manager,
    );

    let fifo = eq.output();
    eq.start().unwrap();
    eq.set_data_on().unwrap();

    let headers = drain_headers(&fifo, 50, Duration::from_secs(5));
    eq.stop().unwrap();
    assert_eq!(headers.len(), 50);

    for (i, h) in headers.iter().enumerate() {
        assert_eq!(h.block_id, i as u64 + 1, "block ids start at 1, in order");
        assert_eq!(h.equipment_id, 42);
        assert_eq!(h.run_number, 777);
        assert_eq!(h.data_size, 1024);
        assert_ne!(h.timeframe_id, UNDEFINED_TIMEFRAME_ID, "software clock tags a TF");
        assert_eq!(h.is_rdh_format, 0);
    }
    // software timeframe ids never decrease
    for w in headers.windows(2) {
        assert!(w[0].timeframe_id <= w[1].timeframe_id);
    }
}

#[test]
fn state_machine_is_enforced() {
    let manager = manager_with_bank(1 << 20);
    let mut eq = build_equipment(
        r#"
        [[equipment]]
        equipment_type = "dummy"
        memory_pool_page_size = "4k"
        memory_pool_number_of_pages = 4
        "#,
        &manager,
    );

    assert_eq!(eq.state(), EquipmentState::Created);
    assert!(eq.set_data_on().is_err(), "data on before start is refused");
    assert!(eq.stop().is_err(), "stop before start is refused");

    eq.start().unwrap();
    assert!(eq.start().is_err(), "double start is refused");
    eq.set_data_on().unwrap();
    eq.set_data_off().unwrap();
    eq.set_data_on().unwrap();
    eq.stop().unwrap();
    assert_eq!(eq.state(), EquipmentState::Stopped);
}

#[test]
fn rate_limit_bounds_emission() {
    let manager = manager_with_bank(4 << 20);
    let mut eq = build_equipment(
        r#"
        [readout]
        rate = 1000.0

        [[equipment]]
        equipment_type = "dummy"
        memory_pool_page_size = "4k"
        memory_pool_number_of_pages = 32
        idle_sleep_time_us = 50
        "#,
        &manager,
    );

    let fifo = eq.output();
    let counters = eq.counters();

    // concurrent drain so the FIFO never throttles the producer
    let stop_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let drain_flag = Arc::clone(&stop_flag);
    let drain_fifo = Arc::clone(&fifo);
    let drainer = std::thread::spawn(move || {
        while !drain_flag.load(std::sync::atomic::Ordering::Relaxed) {
            while drain_fifo.pop().is_some() {}
            std::thread::sleep(Duration::from_micros(100));
        }
    });

    eq.start().unwrap();
    eq.set_data_on().unwrap();
    std::thread::sleep(Duration::from_millis(500));
    eq.stop().unwrap();
    stop_flag.store(true, std::sync::atomic::Ordering::Relaxed);
    drainer.join().unwrap();

    let s = counters.snapshot();
    // 1000 Hz over ~500 ms: allow generous scheduling slop either way
    assert!(
        (400..=520).contains(&s.n_blocks_out),
        "emitted {} blocks, expected ~500",
        s.n_blocks_out
    );
    assert!(
        s.n_throttle > 100,
        "producer should have throttled often, got {}",
        s.n_throttle
    );
}

#[test]
fn full_pipeline_backpressure_and_recovery() {
    let manager = manager_with_bank(1 << 20);
    let mut eq = build_equipment(
        r#"
        [[equipment]]
        equipment_type = "dummy"
        memory_pool_page_size = "4k"
        memory_pool_number_of_pages = 4
        output_fifo_size = 4
        "#,
        &manager,
    );

    let fifo = eq.output();
    let counters = eq.counters();
    let pool = Arc::clone(eq.pool());

    eq.start().unwrap();
    eq.set_data_on().unwrap();

    // all 4 pages end up queued; the producer runs dry and keeps going
    let deadline = Instant::now() + Duration::from_secs(5);
    while fifo.len() < 4 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(fifo.len(), 4);
    std::thread::sleep(Duration::from_millis(20));

    let s = counters.snapshot();
    assert_eq!(s.n_blocks_out, 4, "no page beyond the pool capacity");
    assert!(
        s.n_output_full > 0 || pool.stats().acquire_failures > 0,
        "back-pressure must be accounted"
    );
    assert_eq!(pool.stats().free_pages, 0);

    // consuming one page lets the producer emit exactly one more
    drop(fifo.pop().unwrap());
    let deadline = Instant::now() + Duration::from_secs(5);
    while counters.snapshot().n_blocks_out < 5 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(counters.snapshot().n_blocks_out, 5);

    eq.stop().unwrap();
}

#[test]
fn emulator_pages_carry_rdh_derived_tags() {
    let manager = manager_with_bank(4 << 20);
    let mut eq = build_equipment(
        r#"
        [[equipment]]
        equipment_type = "emulator"
        memory_pool_page_size = "8k"
        memory_pool_number_of_pages = 16
        rdh_check_enabled = true
        emulator_links = [5]
        emulator_cru_id = 12
        emulator_system_id = 3
        emulator_hbf_per_page = 4
        emulator_packet_payload = "192"
        "#,
        &manager,
    );

    let fifo = eq.output();
    let counters = eq.counters();
    eq.start().unwrap();
    eq.set_data_on().unwrap();

    // 64 pages x 4 orbits = 256 orbits: exactly one full timeframe,
    // then the second one starts
    let headers = drain_headers(&fifo, 65, Duration::from_secs(5));
    eq.stop().unwrap();
    assert_eq!(headers.len(), 65);

    for (i, h) in headers.iter().enumerate() {
        assert_eq!(h.is_rdh_format, 1);
        assert_eq!(h.link_id, 5);
        assert_eq!(h.fee_id, 105);
        assert_eq!(h.system_id, 3);
        assert_eq!(h.equipment_id, 120, "cru 12 endpoint 0 -> equipment 120");
        assert_eq!(h.data_size, 8 * 256, "4 HBF x 2 packets x 256 bytes");
        let expected_tf = if i < 64 { 1 } else { 2 };
        assert_eq!(h.timeframe_id, expected_tf, "page {i}");
        if h.timeframe_id == 1 {
            assert_eq!(h.timeframe_orbit_first, 0);
            assert_eq!(h.timeframe_orbit_last, 255);
        }
    }
    assert_eq!(counters.snapshot().rdh_check_err, 0);
    assert_eq!(counters.snapshot().rdh_stream_err, 0);
}

/// Source emitting one handcrafted page whose two RDHs disagree on the
/// link id.
struct MixedLinkSource {
    pool: Option<Arc<flux_memory::PagedPool>>,
    emitted: bool,
}

impl flux_readout::EquipmentSource for MixedLinkSource {
    fn kind(&self) -> &'static str {
        "mixed-link"
    }

    fn init(&mut self, pool: &Arc<flux_memory::PagedPool>) -> Result<(), flux_readout::ReadoutError> {
        self.pool = Some(Arc::clone(pool));
        Ok(())
    }

    fn next_block(&mut self) -> Option<flux_memory::PageRef> {
        if self.emitted {
            return None;
        }
        let mut page = self.pool.as_ref()?.acquire_block()?;
        {
            let payload = page.payload_mut();
            for (ix, link) in [3u8, 5u8].into_iter().enumerate() {
                let rdh = flux_common::rdh::Rdh {
                    link_id: link,
                    offset_next_packet: 128,
                    memory_size: 128,
                    block_length: 128,
                    trigger_orbit: 100,
                    heartbeat_orbit: 100,
                    ..flux_common::rdh::Rdh::default()
                };
                rdh.write_to(&mut payload[ix * 128..]);
            }
        }
        let h = page.header_mut();
        h.data_size = 256;
        h.is_rdh_format = 1;
        self.emitted = true;
        Some(page)
    }
}

#[test]
fn link_mismatch_counts_but_page_is_still_emitted() {
    let manager = manager_with_bank(1 << 20);
    let cfg = ReadoutConfig::from_toml(
        r#"
        [[equipment]]
        equipment_type = "dummy"
        memory_pool_page_size = "4k"
        memory_pool_number_of_pages = 4
        rdh_check_enabled = true
        "#,
    )
    .unwrap();
    let source = Box::new(MixedLinkSource {
        pool: None,
        emitted: false,
    });
    let mut eq =
        ReadoutEquipment::new(&cfg.equipment[0], &cfg.readout, &manager, source, 0).unwrap();

    let fifo = eq.output();
    let counters = eq.counters();
    eq.start().unwrap();
    eq.set_data_on().unwrap();

    let headers = drain_headers(&fifo, 1, Duration::from_secs(5));
    eq.stop().unwrap();

    assert_eq!(headers.len(), 1, "the faulty page is still emitted");
    let h = &headers[0];
    assert_eq!(h.is_rdh_format, 1, "stream error does not clear the RDH flag");
    assert_eq!(h.link_id, 3, "tagged from the first RDH");
    assert_eq!(counters.snapshot().rdh_stream_err, 1);
    assert_eq!(counters.snapshot().rdh_check_err, 0);
}

#[test]
fn player_replays_file_byte_exact() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    file.write_all(&content).unwrap();
    file.flush().unwrap();

    let manager = manager_with_bank(1 << 20);
    let toml = format!(
        r#"
        [[equipment]]
        equipment_type = "player"
        memory_pool_page_size = "4k"
        memory_pool_number_of_pages = 8
        player_file = "{}"
        "#,
        file.path().display()
    );
    let mut eq = build_equipment(&toml, &manager);

    let fifo = eq.output();
    eq.start().unwrap();
    eq.set_data_on().unwrap();

    // payload capacity 4096-128 = 3968 -> 10_000 bytes = 3 chunks
    let pages = drain(&fifo, 3, Duration::from_secs(5));
    assert_eq!(pages.len(), 3);
    std::thread::sleep(Duration::from_millis(20));
    assert!(fifo.pop().is_none(), "player stops at end of file");
    eq.stop().unwrap();

    let replayed: Vec<u8> = pages
        .iter()
        .flat_map(|p| p.payload()[..p.header().data_size as usize].to_vec())
        .collect();
    assert_eq!(replayed, content);
}
