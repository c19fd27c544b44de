//! # Flux readout process
//!
//! Moves raw detector data from equipment sources through shared memory
//! pools into the downstream messaging channel, reorganized as
//! time-bucketed subtimeframes.
//!
//! # Usage
//!
//! ```bash
//! # run with a configuration file until Ctrl-C
//! flux --config config/readout.toml
//!
//! # bounded run with verbose logging
//! flux --config config/readout.toml --duration-s 10 -v
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use flux_common::config::ReadoutConfig;
use flux_common::resources::check_resources;
use flux_common::stats::GLOBAL_STATS;
use flux_common::throttle::LogThrottle;
use flux_common::units::{format_bytes, parse_byte_size};
use flux_dispatch::{
    ChannelTransport, DataAggregator, DispatcherOptions, MessageTransport, NullTransport,
    StfDispatcher, UnmanagedRegion,
};
use flux_memory::{MemoryBank, MemoryBankManager};
use flux_readout::sources::equipment_from_config;

/// Flux - high-throughput detector readout process
#[derive(Parser, Debug)]
#[command(name = "flux")]
#[command(version)]
#[command(about = "Detector front-end readout: equipments -> memory pools -> subtimeframes")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config/readout.toml")]
    config: PathBuf,

    /// Stop after this many seconds (default: run until Ctrl-C).
    #[arg(short = 't', long)]
    duration_s: Option<f64>,

    /// Seconds between global statistics log lines.
    #[arg(long, default_value_t = 5.0)]
    stats_update_s: f64,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    if let Err(e) = run() {
        error!("readout startup failed: {e}");
        std::process::exit(1);
    }
}

fn setup_tracing(args: &Args) {
    let filter = if args.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .try_init();
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    setup_tracing(&args);
    info!("flux readout v{} starting", env!("CARGO_PKG_VERSION"));

    let cfg = ReadoutConfig::load(&args.config)?;

    // The transport region must outlive every bank and pool carved from
    // it; declared first so it drops last.
    let mut region_holder: Option<Arc<UnmanagedRegion>> = None;

    let manager = Arc::new(MemoryBankManager::new());
    for bank_cfg in &cfg.bank {
        let size = parse_byte_size(&bank_cfg.size)
            .ok_or_else(|| format!("bank {}: bad size", bank_cfg.name))? as usize;
        manager.add_bank(Arc::new(MemoryBank::new_owned(&bank_cfg.name, size)?))?;
    }

    // ── dispatcher: transport, optional region, header/repack pool ──
    let dcfg = cfg.dispatcher.clone().unwrap_or_default();

    let mut dispatcher_bank = dcfg.memory_bank_name.clone();
    if let Some(size_str) = &dcfg.unmanaged_memory_size {
        let size = parse_byte_size(size_str).unwrap_or(0) as usize;
        if size > 0 {
            // region creation does not check available memory itself
            check_resources(&dcfg.check_resources, size as u64)?;
            let region = Arc::new(UnmanagedRegion::create(&dcfg.session_name, size)?);
            let bank_name = if dispatcher_bank.is_empty() {
                "transport-region".to_string()
            } else {
                dispatcher_bank.clone()
            };
            // SAFETY: region_holder keeps the mapping alive until after
            // every bank, pool and page has been dropped.
            let bank = unsafe {
                MemoryBank::from_external(bank_name.clone(), region.base(), region.len())
            };
            manager.add_bank(Arc::new(bank))?;
            dispatcher_bank = bank_name;
            region_holder = Some(region);
        }
    }
    let region_backed = region_holder.is_some();

    let transport: Arc<dyn MessageTransport>;
    let mut loopback_consumer = None;
    match dcfg.transport.as_deref().unwrap_or("drop") {
        "loopback" => {
            let (t, rx) = ChannelTransport::new(64);
            loopback_consumer = Some(std::thread::Builder::new().name("loopback".into()).spawn(
                move || {
                    // acknowledge by dropping; exits when the channel closes
                    while let Ok(msg) = rx.recv() {
                        drop(msg);
                    }
                },
            )?);
            transport = t;
            info!("transport: loopback (in-process consumer)");
        }
        "drop" => {
            transport = NullTransport::new();
            info!("transport: drop (count and discard)");
        }
        other => return Err(format!("unknown transport '{other}'").into()),
    }

    let d_page_size = parse_byte_size(&dcfg.memory_pool_page_size)
        .ok_or("dispatcher: bad memory_pool_page_size")? as usize;
    let d_pool = manager.get_paged_pool(
        d_page_size,
        dcfg.memory_pool_number_of_pages,
        &dispatcher_bank,
        0,
        0,
    )?;
    let pool_throttle = LogThrottle::new(Duration::from_secs(10));
    d_pool.set_warning_callback(Box::new(move |msg| {
        if let Some(suppressed) = pool_throttle.allow() {
            warn!(suppressed, "dispatcher: {msg}");
        }
    }));

    let dispatcher = Arc::new(StfDispatcher::new(
        DispatcherOptions::from_config(&dcfg)?,
        Arc::clone(&d_pool),
        Arc::clone(&transport),
        region_backed,
    ));

    // ── equipments and aggregation ──
    let mut equipments = Vec::with_capacity(cfg.equipment.len());
    for (ix, ecfg) in cfg.equipment.iter().enumerate() {
        equipments.push(equipment_from_config(ecfg, &cfg.readout, &manager, ix)?);
    }
    if equipments.is_empty() {
        warn!("no equipment configured, nothing to read out");
    }
    let inputs = equipments.iter().map(|e| e.output()).collect();
    let mut aggregator = DataAggregator::start(inputs, Arc::clone(&dispatcher))?;

    // ── run ──
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            info!("shutdown signal received");
            running.store(false, Ordering::SeqCst);
        })?;
    }

    for eq in &mut equipments {
        eq.start()?;
    }
    for eq in &mut equipments {
        eq.set_data_on()?;
    }
    info!("readout running");

    let t0 = Instant::now();
    let stats_interval = Duration::from_secs_f64(args.stats_update_s.max(0.5));
    let mut next_stats = Instant::now() + stats_interval;
    while running.load(Ordering::SeqCst) {
        if let Some(limit) = args.duration_s {
            if t0.elapsed().as_secs_f64() >= limit {
                info!("configured duration reached");
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(100));
        if Instant::now() >= next_stats {
            log_global_stats(t0.elapsed().as_secs_f64());
            next_stats += stats_interval;
        }
    }

    // ── ordered shutdown: producers, aggregation, dispatch, transport ──
    info!("stopping readout");
    for eq in &mut equipments {
        let _ = eq.set_data_off();
    }
    for eq in &mut equipments {
        eq.stop()?;
    }
    aggregator.stop();
    dispatcher.drain_wait(Duration::from_secs(2));

    let exit_deadline =
        Instant::now() + Duration::from_secs_f64(cfg.readout.exit_timeout_s.max(0.0));
    while transport.outstanding() > 0 && Instant::now() < exit_deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    let leftover = transport.outstanding();
    if leftover > 0 {
        warn!(leftover, "transport messages still in flight at teardown");
    }
    dispatcher.stop();

    log_global_stats(t0.elapsed().as_secs_f64());

    // release transport and consumer before the region goes away
    drop(aggregator);
    drop(dispatcher);
    drop(equipments);
    drop(transport);
    if let Some(handle) = loopback_consumer.take() {
        let _ = handle.join();
    }

    info!("flux readout stopped");
    Ok(())
}

fn log_global_stats(elapsed_s: f64) {
    let bytes_sent = GLOBAL_STATS.bytes_sent.load(Ordering::Relaxed);
    info!(
        pages_pending = GLOBAL_STATS.pages_pending.load(Ordering::Relaxed),
        pages_released = GLOBAL_STATS.pages_released.load(Ordering::Relaxed),
        payload_pending = GLOBAL_STATS.payload_pending_bytes.load(Ordering::Relaxed),
        bytes_sent,
        rate = %format_bytes(bytes_sent as f64 / elapsed_s.max(1e-9), "B/s"),
        timeframe_sent = GLOBAL_STATS.timeframe_id_sent.load(Ordering::Relaxed),
        hbf_repacked = GLOBAL_STATS.hbf_repacked.load(Ordering::Relaxed),
        bytes_copied = GLOBAL_STATS.bytes_copied.load(Ordering::Relaxed),
        "readout stats"
    );
}
