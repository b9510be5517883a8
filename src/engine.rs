// PERCENTINEL ENGINE
// ONE AGGREGATOR, MANY PRODUCERS, ZERO FAST-PATH BLOCKING.
//
// REQUEST THREADS ONLY EVER ENQUEUE. THE AGGREGATOR IS THE SOLE HISTOGRAM
// MUTATOR: IT DRAINS EVERY CPU'S QUEUE, FEEDS THE CURRENT RING SLOT, THEN
// RECOMPUTES AND PUBLISHES PERCENTILES FOR EACH SERVER THAT SAW TRAFFIC.
// A SERVER WHOSE RECONSTRUCTION CAME UP SHORT (COUNTERS STILL IN FLIGHT)
// PARKS ON THE RECALC LIST AND GETS ANOTHER PASS AS SOON AS FRESH SAMPLES
// ARRIVE; THE TIMER TIGHTENS TO ONE JIFFY WHILE ANYTHING IS PARKED.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;

use crate::clock::Clock;
use crate::config::{ApmConfig, ResolvedConfig};
use crate::histogram::VALUE_EXHAUSTED;
use crate::queue::IngestQueue;
use crate::ring::{Rbuf, RbufCtl};
use crate::stats::{
    self, PercentileStats, StatsPair, IDX_AVG, IDX_ITH, IDX_MAX, IDX_MIN, PSTATS_ITH, PSTATS_LEN,
};

// PER-SERVER FLAGS
const FLAG_RECALC: u32 = 0x1; // LAST RECONSTRUCTION WAS PARTIAL, RETRY
const FLAG_UPDONE: u32 = 0x2; // ALREADY QUEUED FOR THIS TICK'S CALC PASS

/// Per-CPU ring capacity. Power of two.
const WQ_CAPACITY: usize = 2048;

/// Per-server engine state. Handed out as an `Arc`: the server inventory
/// holds one clone per attachment and every in-flight queue item holds one,
/// so the strong count is exactly the live reference count.
pub struct ApmData {
    rbuf: Rbuf,
    rbctl: Mutex<RbufCtl>,
    stats: StatsPair,
    flags: AtomicU32,
}

impl ApmData {
    fn new(rbufsz: usize) -> Self {
        Self {
            rbuf: Rbuf::new(rbufsz),
            rbctl: Mutex::new(RbufCtl::default()),
            stats: StatsPair::new(),
            flags: AtomicU32::new(0),
        }
    }

    pub fn rbuf(&self) -> &Rbuf {
        &self.rbuf
    }

    fn updone(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & FLAG_UPDONE != 0
    }

    fn set_updone(&self) {
        self.flags.fetch_or(FLAG_UPDONE, Ordering::Relaxed);
    }

    fn clear_updone(&self) {
        self.flags.fetch_and(!FLAG_UPDONE, Ordering::Relaxed);
    }

    fn set_recalc(&self) {
        self.flags.fetch_or(FLAG_RECALC, Ordering::Relaxed);
    }

    fn take_recalc(&self) -> bool {
        self.flags.fetch_and(!FLAG_RECALC, Ordering::AcqRel) & FLAG_RECALC != 0
    }
}

struct WqItem {
    data: Arc<ApmData>,
    jtstamp: u64,
    rtt: u16,
}

struct Shared {
    cfg: ResolvedConfig,
    clock: Clock,
    queues: Vec<IngestQueue<WqItem>>,
    rearm: AtomicBool,
}

/// The engine instance. `start` spawns the periodic aggregator thread;
/// `start_paused` hands the aggregator back to the caller instead, which is
/// how the tests (and anything else wanting deterministic time) drive it.
pub struct Engine {
    shared: Arc<Shared>,
    timer: Option<JoinHandle<()>>,
}

impl Engine {
    pub fn start(cfg: ApmConfig, clock: Clock) -> Result<Self> {
        let (shared, mut agg) = Self::build(cfg, clock)?;
        let timer = std::thread::Builder::new()
            .name("apm-aggregator".into())
            .spawn(move || {
                while agg.shared.rearm.load(Ordering::Acquire) {
                    let next = agg.run_once();
                    std::thread::sleep(next);
                }
            })
            .context("apm_stats: failed to spawn aggregator")?;
        Ok(Self {
            shared,
            timer: Some(timer),
        })
    }

    /// Build the engine without spawning the timer. The returned
    /// [`Aggregator`] must be driven by hand via [`Aggregator::run_once`].
    pub fn start_paused(cfg: ApmConfig, clock: Clock) -> Result<(Self, Aggregator)> {
        let (shared, agg) = Self::build(cfg, clock)?;
        Ok((
            Self {
                shared,
                timer: None,
            },
            agg,
        ))
    }

    fn build(cfg: ApmConfig, clock: Clock) -> Result<(Arc<Shared>, Aggregator)> {
        let resolved = cfg.resolve(clock.hz())?;
        let queues = (0..num_shards())
            .map(|_| IngestQueue::with_capacity(WQ_CAPACITY))
            .collect();
        let shared = Arc::new(Shared {
            cfg: resolved,
            clock,
            queues,
            rearm: AtomicBool::new(true),
        });
        let agg = Aggregator {
            shared: Arc::clone(&shared),
            qcalc: Vec::new(),
            qrecalc: Vec::new(),
        };
        Ok((shared, agg))
    }

    pub fn clock(&self) -> &Clock {
        &self.shared.clock
    }

    /// Allocate fresh per-server state. The caller (the server inventory)
    /// keeps the handle; cloning it is an attachment, dropping a clone is a
    /// detachment.
    pub fn create(&self) -> Arc<ApmData> {
        Arc::new(ApmData::new(self.shared.cfg.rbufsz))
    }

    /// Record one response time for a server. `jtstamp` is the completion
    /// time and `jrtt` the round trip, both in jiffies. Never blocks: an
    /// unrepresentable RTT or a full queue drops the sample silently.
    pub fn update(&self, data: &Arc<ApmData>, jtstamp: u64, jrtt: u64) {
        let rtt_ms = self.shared.clock.jiffies_to_msecs(jrtt);
        if rtt_ms >= 1 << 16 {
            return;
        }
        let item = WqItem {
            data: Arc::clone(data),
            jtstamp,
            rtt: rtt_ms as u16,
        };
        // FULL RING: THE ITEM (AND ITS REFERENCE) IS DROPPED ON THE FLOOR
        let _ = self.shared.queues[current_shard(self.shared.queues.len())].push(item);
    }

    /// Snapshot the latest published percentiles for a server into `pstats`.
    /// Returns `Some(changed)` where `changed` says whether a publication
    /// happened since the caller's previous snapshot, or `None` when the
    /// caller's percentile set does not match the engine's.
    pub fn stats(&self, data: &ApmData, pstats: &mut PercentileStats) -> Option<bool> {
        if !stats::pstats_verify(pstats) {
            return None;
        }
        Some(data.stats.snapshot(pstats))
    }

    /// Stop the periodic timer and release every queue-held reference.
    /// After this returns, the only references left on any server are the
    /// inventory's own attachments.
    pub fn stop(&mut self) {
        self.shared.rearm.store(false, Ordering::Release);
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
        for q in &self.shared.queues {
            while q.pop().is_some() {}
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The single periodic worker. Owns the calc and recalc lists; nothing else
/// ever touches a histogram's shape.
pub struct Aggregator {
    shared: Arc<Shared>,
    qcalc: Vec<Arc<ApmData>>,
    qrecalc: Vec<Arc<ApmData>>,
}

impl Aggregator {
    /// One timer pass: drain every queue, then recompute every server that
    /// saw updates. Returns the delay before the next pass: one jiffy while
    /// any server is parked for recalculation, a full tick otherwise.
    pub fn run_once(&mut self) -> Duration {
        let shared = Arc::clone(&self.shared);

        for q in &shared.queues {
            while let Some(item) = q.pop() {
                let WqItem { data, jtstamp, rtt } = item;
                update_slot(&shared.cfg, &data, jtstamp, rtt);
                if data.updone() {
                    // LATER SAMPLE FOR A SERVER ALREADY QUEUED THIS PASS:
                    // JUST RELEASE THE QUEUE REFERENCE
                    continue;
                }
                // A SERVER PARKED FOR RECALC MOVES BACK TO THE CALC LIST
                if let Some(i) = self.qrecalc.iter().position(|d| Arc::ptr_eq(d, &data)) {
                    self.qrecalc.remove(i);
                }
                data.set_updone();
                self.qcalc.push(data);
            }
        }

        for data in self.qcalc.drain(..) {
            data.clear_updone();
            if calc(&shared, &data) {
                self.qrecalc.push(data);
            }
        }

        if !self.qrecalc.is_empty() {
            jiffies_duration(1, shared.cfg.hz)
        } else {
            tick_duration(shared.cfg.hz)
        }
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        debug_assert!(self.qcalc.is_empty());
    }
}

// AGGREGATOR PERIOD: HZ/20 JIFFIES, I.E. 50MS
fn tick_duration(hz: u64) -> Duration {
    jiffies_duration(hz / 20, hz)
}

fn jiffies_duration(jiffies: u64, hz: u64) -> Duration {
    Duration::from_millis(jiffies * 1000 / hz)
}

fn num_shards() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn current_shard(nshards: usize) -> usize {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu >= 0 {
        cpu as usize % nshards
    } else {
        0
    }
}

/// Apply one sample to the ring slot its timestamp falls into, resetting
/// the slot first if it still holds an expired interval.
fn update_slot(cfg: &ResolvedConfig, data: &ApmData, jtstamp: u64, rtt: u16) {
    let centry = ((jtstamp / cfg.jtmintrvl) as usize) % data.rbuf.len();
    let jtmistart = jtstamp - (jtstamp % cfg.jtmintrvl);
    let entry = data.rbuf.entry(centry);
    entry.check_reset(jtmistart);
    let _adjust = data.rbuf.lock_adjust();
    entry.ranges.record(rtt);
}

/// Recompute and publish one server's percentiles if anything calls for it.
/// Returns true when the reconstruction was partial and must be retried.
fn calc(shared: &Shared, data: &ApmData) -> bool {
    let recalc = data.take_recalc();
    let (go, total_cnt) = rbctl_update(shared, data, recalc);
    if !go {
        return false;
    }

    let mut val = [0u32; PSTATS_LEN];
    let nfilled = pcntl_calc(&data.rbuf, total_cnt, &mut val);
    if nfilled < PSTATS_LEN {
        data.set_recalc();
        return true;
    }
    data.stats.publish(&val);
    false
}

/// Refresh the cached window aggregates and decide whether the percentiles
/// need recomputing at all.
fn rbctl_update(shared: &Shared, data: &ApmData, recalc: bool) -> (bool, u64) {
    let cfg = &shared.cfg;
    let jtmnow = shared.clock.now();
    let jtmistart = jtmnow - (jtmnow % cfg.jtmintrvl);
    // WRAPPING: ONLY EVER COMPARED FOR EQUALITY, AND THE CLOCK MAY START
    // WITHIN THE FIRST WINDOW
    let jtmwstart = jtmistart.wrapping_sub(cfg.jtmwindow);
    let centry = ((jtmnow / cfg.jtmintrvl) as usize) % data.rbuf.len();

    let mut ctl = data.rbctl.lock();

    // WINDOW MOVED: RESET THE SLOT BEING ENTERED AND RESUM FROM SCRATCH
    if ctl.jtmwstamp != jtmwstart {
        data.rbuf.entry(centry).check_reset(jtmistart);
        let total: u64 = data
            .rbuf
            .entries()
            .iter()
            .map(|e| e.ranges.total_count())
            .sum();
        ctl.entry_cnt = data.rbuf.entry(centry).ranges.total_count();
        ctl.total_cnt = total;
        ctl.jtmwstamp = jtmwstart;
        return (true, ctl.total_cnt);
    }

    let entry_cnt = data.rbuf.entry(centry).ranges.total_count();
    if ctl.entry_cnt == entry_cnt {
        // NO NEW HITS IN THE CURRENT SLOT. A PENDING RECALC STILL RUNS:
        // THE PREVIOUS PASS ENDED EARLY AND ITS COUNTERS HAVE SETTLED NOW.
        return (recalc, ctl.total_cnt);
    }

    ctl.total_cnt += entry_cnt - ctl.entry_cnt;
    ctl.entry_cnt = entry_cnt;
    (true, ctl.total_cnt)
}

/// Reconstruct the percentile values from the ring's bucket counts.
///
/// Walks all slots' live buckets in ascending response time, accumulating
/// hit counts until each target rank is reached. The per-bucket counters
/// trail `tot_cnt` slightly under concurrency, so the walk can exhaust the
/// buckets before the last targets are met; the caller schedules a retry
/// and the published values keep their previous generation meanwhile.
///
/// Returns the number of stat slots filled; `PSTATS_LEN` means complete.
fn pcntl_calc(rbuf: &Rbuf, total_cnt: u64, val: &mut [u32; PSTATS_LEN]) -> usize {
    let mut st: Vec<_> = rbuf
        .entries()
        .iter()
        .map(|e| e.ranges.live_bucket_from(0))
        .collect();

    // TARGET RANKS. A RANK THAT TRUNCATES TO ZERO PUBLISHES ZERO OUTRIGHT.
    let mut pval = [0u64; PSTATS_LEN];
    let mut p = IDX_ITH;
    for i in IDX_ITH..PSTATS_LEN {
        pval[i] = total_cnt * PSTATS_ITH[i] as u64 / 100;
        if pval[i] == 0 {
            val[p] = 0;
            p += 1;
        }
    }

    let mut cum = 0u64;
    while p < PSTATS_LEN {
        let mut v_min = VALUE_EXHAUSTED;
        for s in st.iter() {
            if s.value < v_min {
                v_min = s.value;
            }
        }
        if v_min == VALUE_EXHAUSTED {
            // EVERY SLOT EXHAUSTED SHORT OF THE TARGET: PARTIAL RESULT
            break;
        }
        for (i, entry) in rbuf.entries().iter().enumerate() {
            if st[i].value != v_min {
                continue;
            }
            cum += entry.ranges.bucket_count(st[i].range(), st[i].bucket()) as u64;
            st[i] = entry.ranges.live_bucket_from(st[i].idx + 1);
        }
        // TIES RESOLVE TOGETHER, SO THE OUTPUT IS NON-DECREASING BY SLOT
        while p < PSTATS_LEN && pval[p] <= cum {
            val[p] = v_min as u32;
            p += 1;
        }
    }

    let mut min = u32::MAX;
    let mut max = 0u32;
    let mut cnt = 0u64;
    let mut sum = 0u64;
    for e in rbuf.entries() {
        min = min.min(e.ranges.min_value());
        max = max.max(e.ranges.max_value());
        cnt += e.ranges.total_count();
        sum += e.ranges.total_value();
    }
    val[IDX_MIN] = if cnt == 0 { 0 } else { min };
    val[IDX_MAX] = max;
    val[IDX_AVG] = if cnt == 0 { 0 } else { (sum / cnt) as u32 };

    p
}
