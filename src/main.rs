// PERCENTINEL -- ADAPTIVE UPSTREAM LATENCY PERCENTILE ENGINE
// SYNTHETIC-LOAD DRIVER AND CONFIG CHECKER FOR THE LIBRARY CRATE
//
// THE ENGINE ITSELF LIVES IN THE LIB. THIS BINARY EXISTS TO WATCH IT RUN:
// WORKER THREADS PUSH FAKE RTT SAMPLES, THE AGGREGATOR CHURNS IN THE
// BACKGROUND, AND THE MAIN LOOP PRINTS EACH SERVER'S PUBLISHED TABLE ONCE
// PER SECOND UNTIL CTRL+C.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rand::Rng;

use percentinel::stats::{IDX_AVG, IDX_ITH, IDX_MAX, IDX_MIN};
use percentinel::{ApmConfig, ApmData, Clock, Engine, PercentileStats, DEFAULT_HZ};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(name = "percentinel")]
#[command(about = "PERCENTINEL -- ADAPTIVE UPSTREAM LATENCY PERCENTILE ENGINE")]
struct Cli {
    #[command(subcommand)]
    command: Option<SubCmd>,
}

#[derive(Subcommand)]
enum SubCmd {
    /// Run the engine against a synthetic workload (ctrl+c to exit)
    Run(RunArgs),

    /// Validate a window=N scale=N configuration and print derived values
    Check(CheckArgs),
}

#[derive(Parser)]
struct RunArgs {
    /// Sliding window in seconds
    #[arg(long, default_value_t = 300)]
    window: u64,

    /// Ring buffer slots per window
    #[arg(long, default_value_t = 5)]
    scale: u64,

    /// Number of simulated upstream servers
    #[arg(long, default_value_t = 4)]
    servers: usize,

    /// Load generator threads
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Baseline response time per server, milliseconds
    #[arg(long, default_value_t = 30)]
    base_ms: u64,

    /// Samples per second per worker
    #[arg(long, default_value_t = 2000)]
    rate: u64,

    /// Percent chance a sample is a 20x tail spike
    #[arg(long, default_value_t = 1)]
    spike_pct: u64,
}

#[derive(Parser)]
struct CheckArgs {
    /// key=value entries, e.g. window=300 scale=5
    entries: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None => run_load(RunArgs::parse_from(["percentinel"])),
        Some(SubCmd::Run(args)) => run_load(args),
        Some(SubCmd::Check(args)) => run_check(&args.entries),
    }
}

fn run_check(entries: &[String]) -> Result<()> {
    let cfg = ApmConfig::parse_kv(entries)?;
    let rc = cfg.resolve(DEFAULT_HZ)?;
    println!(
        "WINDOW:   {} s ({} jiffies effective)",
        cfg.window_secs, rc.jtmwindow
    );
    println!("SCALE:    {} ({} ring slots)", cfg.scale, rc.rbufsz);
    println!(
        "INTERVAL: {} jiffies ({} s)",
        rc.jtmintrvl,
        rc.jtmintrvl / rc.hz
    );
    Ok(())
}

fn run_load(args: RunArgs) -> Result<()> {
    ctrlc::set_handler(move || {
        SHUTDOWN.store(true, Ordering::Relaxed);
    })?;

    let cfg = ApmConfig {
        window_secs: args.window,
        scale: args.scale,
    };
    let engine = Engine::start(cfg, Clock::monotonic())?;

    println!("PERCENTINEL v0.6.2");
    println!("WINDOW:   {} s x {} SLOTS", args.window, args.scale);
    println!(
        "LOAD:     {} SERVERS, {} WORKERS, {} SAMPLES/S EACH, {}% SPIKES",
        args.servers, args.workers, args.rate, args.spike_pct
    );
    println!();

    let servers: Vec<Arc<ApmData>> = (0..args.servers.max(1)).map(|_| engine.create()).collect();

    let engine = Arc::new(engine);
    let mut workers = Vec::new();
    for w in 0..args.workers.max(1) {
        let engine = Arc::clone(&engine);
        let servers = servers.clone();
        let base_ms = args.base_ms;
        let rate = args.rate.max(1);
        let spike_pct = args.spike_pct;
        workers.push(std::thread::spawn(move || {
            let mut rng = rand::thread_rng();
            while !SHUTDOWN.load(Ordering::Relaxed) {
                for (i, srv) in servers.iter().enumerate() {
                    // EACH SERVER GETS ITS OWN BASELINE SO THE TABLES DIFFER
                    let base = base_ms * (i as u64 + 1) + w as u64;
                    let jitter = rng.gen_range(0..=base / 2 + 1);
                    let mut rtt_ms = base + jitter;
                    if spike_pct > 0 && rng.gen_range(0..100) < spike_pct {
                        rtt_ms *= 20;
                    }
                    let clock = engine.clock();
                    engine.update(srv, clock.now(), clock.msecs_to_jiffies(rtt_ms));
                }
                std::thread::sleep(Duration::from_micros(1_000_000 / rate));
            }
        }));
    }

    let mut tables: Vec<PercentileStats> =
        (0..servers.len()).map(|_| PercentileStats::new()).collect();

    while !SHUTDOWN.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_secs(1));
        for (i, srv) in servers.iter().enumerate() {
            let pstats = &mut tables[i];
            let changed = engine.stats(srv, pstats).unwrap_or(false);
            println!(
                "srv{:<2} seq: {:<6} min: {:<6} avg: {:<6} p50: {:<6} p75: {:<6} p90: {:<6} p95: {:<6} p99: {:<6} max: {:<6}{}",
                i,
                pstats.seq,
                pstats.val[IDX_MIN],
                pstats.val[IDX_AVG],
                pstats.val[IDX_ITH],
                pstats.val[IDX_ITH + 1],
                pstats.val[IDX_ITH + 2],
                pstats.val[IDX_ITH + 3],
                pstats.val[IDX_ITH + 4],
                pstats.val[IDX_MAX],
                if changed { "" } else { "  (STALE)" },
            );
        }
        println!();
    }

    println!("PERCENTINEL IS SHUTTING DOWN");
    for w in workers {
        let _ = w.join();
    }
    drop(servers);
    drop(engine); // JOINS THE AGGREGATOR AND DRAINS THE QUEUES
    println!("PERCENTINEL OUT.");
    Ok(())
}
