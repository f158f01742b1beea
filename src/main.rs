use stackfetch::cli::Args;
use stackfetch::config::{self, Config, PathConfig};
use stackfetch::core::engine::Engine;
use stackfetch::core::event_bus::downcast_event;
use stackfetch::core::events::{ClipStopped, LoadFailed};
use stackfetch::core::fetcher::ThreadedFetcher;
use stackfetch::core::frame_store::LruFrameStore;
use stackfetch::core::workers::Workers;
use stackfetch::entities::Lane;
use stackfetch::sim::{LoggingSurface, SyntheticLoader, stack_keys};

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Host loop period (60 Hz)
const FRAME_PERIOD: Duration = Duration::from_millis(16);
/// How often the second stack is scrolled
const SCROLL_PERIOD: Duration = Duration::from_millis(250);
/// How often the third stack takes a sequential step
const STEP_PERIOD: Duration = Duration::from_millis(400);

fn init_logging(args: &Args, path_config: &PathConfig) -> Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .as_ref()
            .cloned()
            .unwrap_or_else(|| config::data_file(config::LOG_FILE, path_config));

        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Console logging (respects RUST_LOG if set)
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };

        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

fn load_config(args: &Args, path_config: &PathConfig) -> Result<Config> {
    let path = args
        .config
        .clone()
        .unwrap_or_else(|| config::config_file(config::CONFIG_FILE, path_config));
    info!("Config path: {}", path.display());
    let mut config = Config::load(&path)?;

    // CLI overrides
    if let Some(fps) = args.fps {
        config.clip.frames_per_second = fps;
    }
    if args.no_loop {
        config.clip.looping = false;
    }
    if args.max_prefetch.is_some() {
        config.prefetch.max_images_to_prefetch = args.max_prefetch;
    }
    if args.concurrency.is_some() {
        config.scheduler.max_simultaneous_requests = args.concurrency;
    }
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let path_config = PathConfig::from_env_and_cli(args.config_dir.clone());
    if let Err(e) = config::ensure_dirs(&path_config) {
        eprintln!("Warning: Failed to create application directories: {}", e);
    }

    init_logging(&args, &path_config)?;
    info!("stackfetch {} starting...", env!("CARGO_PKG_VERSION"));
    debug!("Command-line args: {:?}", args);

    let config = load_config(&args, &path_config)?;
    debug!("Config: {:?}", config);

    let store = Arc::new(LruFrameStore::new(config.store.capacity, config.store.max_bytes));
    let workers = Workers::new(config.scheduler.worker_threads()).context("Failed to spawn loader threads")?;
    info!("Loader threads: {}", workers.threads());

    let loader = Arc::new(SyntheticLoader::new(Duration::from_millis(args.latency_ms), args.fail_every));
    let fetcher = Arc::new(ThreadedFetcher::new(workers, loader.clone()));
    let surface = Arc::new(LoggingSurface::new());

    let mut engine = Engine::new(
        &config,
        store.clone(),
        fetcher,
        surface.clone(),
        config.scheduler.hint(),
    );

    let viewports: Vec<_> = (0..args.stacks.max(1))
        .map(|s| engine.attach(stack_keys(s, args.frames), args.frames / 2))
        .collect();

    let start = Instant::now();
    let first = viewports[0].id();
    if !engine.play(first, None, start) {
        warn!("Clip playback not started");
    }
    engine.prefetch_study(first);

    let deadline = start + Duration::from_millis(args.duration_ms);
    let mut next_scroll = start + SCROLL_PERIOD;
    let mut next_step = start + STEP_PERIOD;
    let mut scroll_dir: isize = 1;
    let mut failures = 0usize;

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }

        if let Some(vp) = viewports.get(1)
            && now >= next_scroll
        {
            if !engine.scroll(vp.id(), 3 * scroll_dir) {
                scroll_dir = -scroll_dir;
            }
            next_scroll = now + SCROLL_PERIOD;
        }
        if let Some(vp) = viewports.get(2)
            && now >= next_step
        {
            let target = (vp.current_index() + 1) % vp.len().max(1);
            engine.go_to_sequential(vp.id(), target as isize);
            next_step = now + STEP_PERIOD;
        }

        let report = engine.update(now);
        for event in engine.bus().poll() {
            if let Some(e) = downcast_event::<LoadFailed>(&event) {
                failures += 1;
                debug!("{:?} failure for {}: {}", e.subsystem, e.key, e.error);
            } else if let Some(e) = downcast_event::<ClipStopped>(&event) {
                info!("Clip stopped on {}", e.viewport);
            }
        }

        if report.is_idle() {
            engine.pool().pump_timeout(FRAME_PERIOD);
        } else {
            thread::sleep(FRAME_PERIOD);
        }
    }

    let stats = engine.pool().stats();
    let cache = store.stats();
    println!("session:       {} ms, {} stack(s) x {} frame(s)", args.duration_ms, viewports.len(), args.frames);
    println!("paints:        {}", surface.painted());
    println!("loads:         {}", loader.loads());
    println!(
        "pool:          {} issued, {} joined, {} store hits, {} failed",
        stats.issued(),
        stats.joined(),
        stats.store_hits(),
        stats.failures()
    );
    for lane in Lane::PRIORITY {
        println!(
            "  {:<12} {} in flight, {} queued",
            lane.name(),
            engine.pool().in_flight(lane),
            engine.pool().queued(lane)
        );
    }
    println!(
        "store:         {} frame(s), {} bytes, {} eviction(s)",
        store.len(),
        store.bytes(),
        cache.evictions()
    );
    println!("failures:      {}", failures);
    Ok(())
}
