// PERCENTINEL ENGINE TESTS
// END-TO-END ON A MANUAL CLOCK: PAUSED AGGREGATOR, DETERMINISTIC TICKS.
// WINDOW=300s SCALE=5 THROUGHOUT, SO ONE RING SLOT IS 60000 JIFFIES.

use std::sync::Arc;

use percentinel::histogram::LAST_RANGE;
use percentinel::stats::{IDX_AVG, IDX_ITH, IDX_MAX, IDX_MIN, PSTATS_LEN};
use percentinel::{Aggregator, ApmConfig, ApmData, Clock, Engine, ManualClock, PercentileStats};

const INTERVAL: u64 = 60_000;
// ALIGNED TO AN INTERVAL BOUNDARY: 60000 * 167
const START: u64 = 10_020_000;

fn engine_300_5() -> (Engine, Aggregator, ManualClock) {
    let (clock, handle) = Clock::manual(START);
    let cfg = ApmConfig {
        window_secs: 300,
        scale: 5,
    };
    let (engine, agg) = Engine::start_paused(cfg, clock).unwrap();
    (engine, agg, handle)
}

fn read(engine: &Engine, data: &ApmData) -> (PercentileStats, bool) {
    let mut pstats = PercentileStats::new();
    let changed = engine.stats(data, &mut pstats).unwrap();
    (pstats, changed)
}

fn window_total(data: &ApmData) -> u64 {
    data.rbuf()
        .entries()
        .iter()
        .map(|e| e.ranges.total_count())
        .sum()
}

// === END-TO-END SCENARIOS ===

#[test]
fn constant_stream_publishes_the_value() {
    let (engine, mut agg, handle) = engine_300_5();
    let srv = engine.create();

    for _ in 0..100 {
        engine.update(&srv, handle.now(), 10);
    }
    agg.run_once();

    let (pstats, changed) = read(&engine, &srv);
    assert!(changed);
    assert_eq!(pstats.val[IDX_MIN], 10);
    assert_eq!(pstats.val[IDX_MAX], 10);
    assert_eq!(pstats.val[IDX_AVG], 10);
    for k in IDX_ITH..PSTATS_LEN {
        assert_eq!(pstats.val[k], 10, "quantile slot {k}");
    }
}

#[test]
fn uniform_ramp_lands_on_bucket_representatives() {
    let (engine, mut agg, handle) = engine_300_5();
    let srv = engine.create();

    for v in 1..=100u64 {
        engine.update(&srv, handle.now(), v);
    }
    agg.run_once();

    let (pstats, _) = read(&engine, &srv);
    assert_eq!(pstats.val[IDX_MIN], 1);
    assert_eq!(pstats.val[IDX_MAX], 100);
    assert_eq!(pstats.val[IDX_AVG], 50);

    // BUCKET-GRANULAR: EACH TARGET RESOLVES TO ITS BUCKET'S VALUE
    assert_eq!(pstats.val[IDX_ITH], 52); // p50
    assert_eq!(pstats.val[IDX_ITH + 1], 76); // p75
    assert_eq!(pstats.val[IDX_ITH + 2], 92); // p90
    assert_eq!(pstats.val[IDX_ITH + 3], 96); // p95
    assert_eq!(pstats.val[IDX_ITH + 4], 100); // p99
}

#[test]
fn tail_spike_extends_the_last_range() {
    let (engine, mut agg, handle) = engine_300_5();
    let srv = engine.create();

    for _ in 0..99 {
        engine.update(&srv, handle.now(), 10);
    }
    engine.update(&srv, handle.now(), 50_000);
    agg.run_once();

    let fed = srv
        .rbuf()
        .entries()
        .iter()
        .find(|e| e.ranges.total_count() > 0)
        .unwrap();
    assert!(fed.ranges.ctl(LAST_RANGE).end >= 50_000);

    let (pstats, _) = read(&engine, &srv);
    assert_eq!(pstats.val[IDX_MAX], 50_000);
    assert_eq!(pstats.val[IDX_ITH], 10); // p50
    // 99 OF 100 SAMPLES ARE 10: THE TRUNCATED p99 RANK (99) IS MET AT 10
    assert_eq!(pstats.val[IDX_ITH + 4], 10);
}

#[test]
fn heavier_tail_pushes_p99_into_the_extended_range() {
    let (engine, mut agg, handle) = engine_300_5();
    let srv = engine.create();

    for _ in 0..97 {
        engine.update(&srv, handle.now(), 10);
    }
    for _ in 0..3 {
        engine.update(&srv, handle.now(), 50_000);
    }
    agg.run_once();

    let (pstats, _) = read(&engine, &srv);
    assert_eq!(pstats.val[IDX_ITH + 3], 10); // p95 STAYS ON THE BODY
    // p99 LANDS ON THE SPIKE'S BUCKET REPRESENTATIVE
    let p99 = pstats.val[IDX_ITH + 4];
    assert!(p99 >= 50_000 && p99 <= 61_549, "p99 = {p99}");
    assert_eq!(pstats.val[IDX_MAX], 50_000);
}

#[test]
fn adjust_converges_on_a_hot_value() {
    let (engine, mut agg, handle) = engine_300_5();
    let srv = engine.create();

    for _ in 0..10 {
        for _ in 0..1_000 {
            engine.update(&srv, handle.now(), 200);
        }
        agg.run_once();
    }

    let (pstats, _) = read(&engine, &srv);
    assert_eq!(pstats.val[IDX_MIN], 200);
    assert_eq!(pstats.val[IDX_MAX], 200);
    assert_eq!(pstats.val[IDX_AVG], 200);
    // WITHIN HALF A BUCKET OF THE TRUE VALUE
    let p50 = pstats.val[IDX_ITH] as i64;
    assert!((p50 - 200).abs() <= 9, "p50 = {p50}");
}

#[test]
fn overload_drops_samples_but_results_stay_well_formed() {
    let (engine, mut agg, handle) = engine_300_5();
    let srv = engine.create();

    // FAR MORE THAN ONE RING'S CAPACITY, NO DRAIN IN BETWEEN
    for i in 0..5_000u64 {
        engine.update(&srv, handle.now(), 10 + i % 50);
    }
    agg.run_once();

    let total = window_total(&srv);
    assert!(total > 0);
    assert!(total <= 5_000);

    let (pstats, _) = read(&engine, &srv);
    for k in IDX_ITH..PSTATS_LEN - 1 {
        assert!(pstats.val[k] <= pstats.val[k + 1], "quantiles not monotone");
    }
    assert!(pstats.val[IDX_MIN] as u64 >= 10);
    assert!(pstats.val[IDX_MAX] as u64 <= 59);
}

#[test]
fn window_expiry_forgets_old_intervals() {
    let (engine, mut agg, handle) = engine_300_5();
    let srv = engine.create();

    for _ in 0..100 {
        engine.update(&srv, handle.now(), 10);
    }
    agg.run_once();
    let (pstats, _) = read(&engine, &srv);
    assert_eq!(pstats.val[IDX_ITH], 10);

    // WALK A FULL WINDOW PLUS ONE INTERVAL; EVERY SLOT GETS REUSED
    for _ in 0..6 {
        handle.advance(INTERVAL);
        engine.update(&srv, handle.now(), 12);
        engine.update(&srv, handle.now(), 12);
        agg.run_once();
    }

    // THE HUNDRED 10s ARE GONE: ONLY THE LAST FIVE INTERVALS REMAIN
    assert_eq!(window_total(&srv), 10);
    for e in srv.rbuf().entries() {
        assert_eq!(e.ranges.total_count(), 2);
    }

    let (pstats, _) = read(&engine, &srv);
    assert_eq!(pstats.val[IDX_MIN], 12);
    assert_eq!(pstats.val[IDX_MAX], 12);
    assert_eq!(pstats.val[IDX_AVG], 12);
    for k in IDX_ITH..PSTATS_LEN {
        assert_eq!(pstats.val[k], 12);
    }
}

// === INVARIANTS ===

#[test]
fn drained_total_matches_accepted_pushes() {
    let (engine, mut agg, handle) = engine_300_5();
    let srv = engine.create();

    for v in 0..777u64 {
        engine.update(&srv, handle.now(), v % 300);
    }
    agg.run_once();
    assert_eq!(window_total(&srv), 777);
}

#[test]
fn publication_sequence_is_monotonic() {
    let (engine, mut agg, handle) = engine_300_5();
    let srv = engine.create();
    let mut pstats = PercentileStats::new();

    let mut last_seq = 0;
    for i in 0..20u64 {
        engine.update(&srv, handle.now(), 10 + i);
        agg.run_once();
        engine.stats(&srv, &mut pstats).unwrap();
        assert!(pstats.seq > last_seq);
        last_seq = pstats.seq;
    }
}

#[test]
fn repeated_stats_report_unchanged() {
    let (engine, mut agg, handle) = engine_300_5();
    let srv = engine.create();

    engine.update(&srv, handle.now(), 42);
    engine.update(&srv, handle.now(), 42);
    agg.run_once();

    let mut pstats = PercentileStats::new();
    assert!(engine.stats(&srv, &mut pstats).unwrap());
    assert!(!engine.stats(&srv, &mut pstats).unwrap());

    // NO NEW SAMPLES: ANOTHER PASS PUBLISHES NOTHING
    agg.run_once();
    assert!(!engine.stats(&srv, &mut pstats).unwrap());
    assert_eq!(pstats.val[IDX_ITH], 42);

    engine.update(&srv, handle.now(), 42);
    agg.run_once();
    assert!(engine.stats(&srv, &mut pstats).unwrap());
}

#[test]
fn stop_releases_every_queued_reference() {
    let (mut engine, agg, handle) = engine_300_5();
    let srv = engine.create();
    let attachment = Arc::clone(&srv);
    assert_eq!(Arc::strong_count(&srv), 2);

    for _ in 0..10 {
        engine.update(&srv, handle.now(), 5);
    }
    assert_eq!(Arc::strong_count(&srv), 12);

    engine.stop();
    drop(agg);
    assert_eq!(Arc::strong_count(&srv), 2);
    drop(attachment);
    assert_eq!(Arc::strong_count(&srv), 1);
}

#[test]
fn replay_reproduces_identical_results() {
    // BODY AT 10MS PLUS RARE 50s SPIKES: ORDER-INSENSITIVE, SO THE RESULT
    // IS IDENTICAL EVEN IF THE SAMPLES SPLIT ACROSS CPU SHARDS DIFFERENTLY
    let run = || {
        let (engine, mut agg, handle) = engine_300_5();
        let srv = engine.create();
        for i in 0..1_500u64 {
            let rtt = if i % 300 == 299 { 50_000 } else { 10 };
            engine.update(&srv, handle.now(), rtt);
        }
        agg.run_once();
        let (pstats, _) = read(&engine, &srv);
        let ctl3 = srv
            .rbuf()
            .entries()
            .iter()
            .find(|e| e.ranges.total_count() > 0)
            .unwrap()
            .ranges
            .ctl(LAST_RANGE);
        (pstats.val, ctl3)
    };
    let (val, ctl3) = run();
    assert_eq!((val, ctl3), run());
    assert!(ctl3.end >= 50_000);
    assert_eq!(val[IDX_MIN], 10);
    assert_eq!(val[IDX_MAX], 50_000);
}

// === BOUNDARY BEHAVIOUR ===

#[test]
fn zero_rtt_is_accepted() {
    let (engine, mut agg, handle) = engine_300_5();
    let srv = engine.create();
    engine.update(&srv, handle.now(), 0);
    agg.run_once();
    assert_eq!(window_total(&srv), 1);
}

#[test]
fn oversized_rtt_is_dropped() {
    let (engine, mut agg, handle) = engine_300_5();
    let srv = engine.create();
    engine.update(&srv, handle.now(), 1 << 16);
    agg.run_once();
    assert_eq!(window_total(&srv), 0);

    engine.update(&srv, handle.now(), (1 << 16) - 1);
    agg.run_once();
    assert_eq!(window_total(&srv), 1);
}

#[test]
fn scale_one_runs_with_two_slots() {
    let (clock, _handle) = Clock::manual(START);
    let cfg = ApmConfig {
        window_secs: 300,
        scale: 1,
    };
    let (engine, _agg) = Engine::start_paused(cfg, clock).unwrap();
    assert_eq!(engine.create().rbuf().len(), 2);
}

#[test]
fn overlong_interval_fails_start() {
    let (clock, _handle) = Clock::manual(START);
    let cfg = ApmConfig {
        window_secs: 60,
        scale: 50,
    };
    assert!(Engine::start_paused(cfg, clock).is_err());
}

#[test]
fn mismatched_percentile_set_is_rejected() {
    let (engine, _agg, _handle) = engine_300_5();
    let srv = engine.create();

    static WRONG: [u32; PSTATS_LEN] = [0, 0, 0, 25, 50, 75, 90, 99];
    let mut pstats = PercentileStats::new();
    pstats.ith = &WRONG;
    assert!(engine.stats(&srv, &mut pstats).is_none());
}

// === TIMER MODE ===

#[test]
fn timer_mode_publishes_and_stops_cleanly() {
    let cfg = ApmConfig {
        window_secs: 300,
        scale: 5,
    };
    let mut engine = Engine::start(cfg, Clock::monotonic()).unwrap();
    let srv = engine.create();

    let clock = engine.clock().clone();
    for _ in 0..50 {
        engine.update(&srv, clock.now(), 10);
    }

    // A TICK IS 50MS; GIVE THE AGGREGATOR A FEW
    let mut pstats = PercentileStats::new();
    let mut published = false;
    for _ in 0..40 {
        std::thread::sleep(std::time::Duration::from_millis(25));
        if engine.stats(&srv, &mut pstats).unwrap() {
            published = true;
            break;
        }
    }
    assert!(published);
    assert_eq!(pstats.val[IDX_ITH], 10);

    engine.stop();
    assert_eq!(Arc::strong_count(&srv), 1);
}
